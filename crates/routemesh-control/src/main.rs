#![warn(missing_docs)]

//! `rm-component`: a routemesh component that forwards requests to its
//! upstream instances, or echoes them when it has none.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use routemesh_control::config::Cli;
use routemesh_control::{
    logging, register_or_abort, ComponentHandler, EventType, StorageAssociation,
    StorageChangedListener,
};
use routemesh_transport::{ComponentServer, RpcServer};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();
    let config = cli.component;
    tracing::info!(
        component_type = %config.component_type,
        port = config.port,
        upstreams = config.upstreams.len(),
        "routemesh component starting"
    );

    let storage = Arc::new(StorageAssociation::new(config.dial()));
    storage.on_new_association(|endpoint| {
        tracing::info!(endpoint = %endpoint, "storage provider ready");
    });

    let component = ComponentServer::new()
        .with_request_handler(ComponentHandler::from_config(&config))
        .with_storage_push(storage.clone());

    let server = RpcServer::bind(&config.listen_addr(), config.dial())
        .await
        .with_context(|| format!("could not listen on {}", config.listen_addr()))?;
    let shutdown = server.shutdown_token();
    let serve_handle = tokio::spawn(server.serve(Arc::new(component)));

    let control_plane = register_or_abort(
        &config.control_plane(),
        &config.component_type,
        &config.own_endpoint(),
    )
    .await;

    if let Err(e) = control_plane
        .subscribe(
            EventType::StorageChanged,
            Arc::new(StorageChangedListener::new(storage.clone())),
        )
        .await
    {
        tracing::warn!(error = %e, "could not subscribe to storage changes");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("received Ctrl+C, shutting down...");

    control_plane.close();
    shutdown.cancel();
    if let Err(e) = serve_handle.await? {
        tracing::warn!(error = %e, "server stopped with error");
    }
    logging::flush();
    Ok(())
}
