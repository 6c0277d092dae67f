//! Typed requests and responses, and their mapping to the chunk wire format.
//!
//! An exchange is exactly one [`Chunk::Header`] followed by the body's
//! [`Chunk::BodyChunk`]s. Decoding validates the header before any body work
//! starts, so a malformed exchange never reaches a handler.

use std::collections::HashMap;
use std::sync::Arc;

use crate::body::{Body, StreamErrors};
use crate::error::{Result, TransportError};
use crate::protocol::{
    Chunk, Header, HeaderContent, HttpData, RequestHeader, ResponseHeader, RoutingData,
};
use crate::stream::ChunkStream;

const VALUE_SEPARATOR: char = ';';

/// Canonical MIME form of a header key: `content-type` becomes
/// `Content-Type`.
pub fn canonical_key(key: &str) -> String {
    key.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => {
                    let mut word = first.to_ascii_uppercase().to_string();
                    word.push_str(&chars.as_str().to_ascii_lowercase());
                    word
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Header map with canonicalised keys. Multiple values of one key are stored
/// in a single string separated by `;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(HashMap<String, String>);

impl Headers {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the value of `key`.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(canonical_key(key), value.into());
    }

    /// Adds a value to `key`, keeping existing values.
    pub fn add(&mut self, key: &str, value: &str) {
        let entry = self.0.entry(canonical_key(key)).or_default();
        if !entry.is_empty() {
            entry.push(VALUE_SEPARATOR);
        }
        entry.push_str(value);
    }

    /// Whole value of `key`, all parts included.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&canonical_key(key)).map(String::as_str)
    }

    /// Individual values of `key`.
    pub fn get_values(&self, key: &str) -> Vec<&str> {
        match self.get(key) {
            Some(value) if !value.is_empty() => value.split(VALUE_SEPARATOR).collect(),
            _ => Vec::new(),
        }
    }

    /// Replaces `key` with several values.
    pub fn set_values<S: AsRef<str>>(&mut self, key: &str, values: &[S]) {
        let joined = values
            .iter()
            .map(AsRef::as_ref)
            .collect::<Vec<_>>()
            .join(";");
        self.0.insert(canonical_key(key), joined);
    }

    /// Removes `key`.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(&canonical_key(key))
    }

    /// Number of keys.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map has no keys.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over `(key, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl From<HashMap<String, String>> for Headers {
    fn from(raw: HashMap<String, String>) -> Self {
        Self(
            raw.into_iter()
                .map(|(key, value)| (canonical_key(&key), value))
                .collect(),
        )
    }
}

impl From<Headers> for HashMap<String, String> {
    fn from(headers: Headers) -> Self {
        headers.0
    }
}

/// Request routed between components.
#[derive(Debug, Default)]
pub struct Request {
    /// Request method.
    pub method: String,
    /// Target host.
    pub host: String,
    /// Request path.
    pub path: String,
    /// Request headers.
    pub headers: Headers,
    /// Source address of the original client.
    pub source: String,
    /// Route, step and correlation id.
    pub routing: RoutingData,
    /// Free-form data passed between services.
    pub service_data: HashMap<String, String>,
    /// Request body.
    pub body: Body,
}

impl Request {
    /// Create an empty request.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this request if its body is fully buffered. A body still
    /// receiving from a stream cannot be duplicated.
    pub fn try_clone(&self) -> Option<Self> {
        if self.body.is_receiving() {
            return None;
        }
        Some(Self {
            method: self.method.clone(),
            host: self.host.clone(),
            path: self.path.clone(),
            headers: self.headers.clone(),
            source: self.source.clone(),
            routing: self.routing.clone(),
            service_data: self.service_data.clone(),
            body: Body::from(self.body.buffered().to_vec()),
        })
    }
}

/// Response to a [`Request`].
#[derive(Debug)]
pub struct Response {
    /// HTTP status code.
    pub status: i32,
    /// Response headers.
    pub headers: Headers,
    /// Correlation id of the originating request.
    pub request_uid: String,
    /// Response body.
    pub body: Body,
}

impl Default for Response {
    fn default() -> Self {
        Self {
            status: 200,
            headers: Headers::new(),
            request_uid: "not set".to_string(),
            body: Body::new(),
        }
    }
}

impl Response {
    /// Create a `200` response without correlation id.
    pub fn new() -> Self {
        Self::default()
    }
}

/// A message that travels as one header chunk plus body chunks.
pub trait Envelope: Sized + Send {
    /// Builds the message from a header chunk. The body is left empty.
    fn from_header(header: Header) -> Result<Self>;

    /// Header chunk describing this message.
    fn to_header(&self) -> Header;

    /// The message body.
    fn body_mut(&mut self) -> &mut Body;

    /// Moves the body out, leaving an empty one.
    fn take_body(&mut self) -> Body {
        std::mem::take(self.body_mut())
    }
}

impl Envelope for Request {
    fn from_header(header: Header) -> Result<Self> {
        let header = match header.content {
            Some(HeaderContent::Request(header)) => header,
            Some(HeaderContent::Response(_)) => {
                return Err(TransportError::conversion("expected a request header"))
            }
            None => return Err(TransportError::conversion("header content missing")),
        };
        let http = header
            .http_data
            .ok_or_else(|| TransportError::conversion("http data missing"))?;
        let routing = header
            .routing_data
            .ok_or_else(|| TransportError::conversion("routing data missing"))?;
        Ok(Self {
            method: http.method,
            host: http.host,
            path: http.path,
            headers: Headers::from(http.headers),
            source: http.source,
            routing,
            service_data: header.service_data.unwrap_or_default(),
            body: Body::new(),
        })
    }

    fn to_header(&self) -> Header {
        Header {
            content: Some(HeaderContent::Request(RequestHeader {
                http_data: Some(HttpData {
                    method: self.method.clone(),
                    host: self.host.clone(),
                    path: self.path.clone(),
                    headers: self.headers.clone().into(),
                    source: self.source.clone(),
                }),
                routing_data: Some(self.routing.clone()),
                service_data: Some(self.service_data.clone()),
            })),
        }
    }

    fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }
}

impl Envelope for Response {
    fn from_header(header: Header) -> Result<Self> {
        match header.content {
            Some(HeaderContent::Response(header)) => Ok(Self {
                status: header.status,
                headers: Headers::from(header.headers),
                request_uid: header.request_uid,
                body: Body::new(),
            }),
            Some(HeaderContent::Request(_)) => {
                Err(TransportError::conversion("expected a response header"))
            }
            None => Err(TransportError::conversion("header content missing")),
        }
    }

    fn to_header(&self) -> Header {
        Header {
            content: Some(HeaderContent::Response(ResponseHeader {
                status: self.status,
                headers: self.headers.clone().into(),
                request_uid: self.request_uid.clone(),
            })),
        }
    }

    fn body_mut(&mut self) -> &mut Body {
        &mut self.body
    }
}

/// Reads the header chunk of an exchange and connects the message body to
/// the rest of the stream.
pub async fn receive<E: Envelope>(stream: Arc<dyn ChunkStream>) -> Result<(E, StreamErrors)> {
    let first = stream
        .recv_chunk()
        .await?
        .ok_or_else(|| TransportError::stream("stream ended before a header"))?;
    let header = match first {
        Chunk::Header(header) => header,
        Chunk::BodyChunk(_) => {
            return Err(TransportError::conversion("first chunk is not a header"))
        }
    };
    let mut message = E::from_header(header)?;
    let errors = message.body_mut().connect_receive(stream)?;
    Ok((message, errors))
}

/// Sends the header chunk of `message`, then hands its body to a send task.
pub async fn send<E: Envelope>(
    stream: Arc<dyn ChunkStream>,
    mut message: E,
) -> Result<StreamErrors> {
    stream.send_chunk(Chunk::Header(message.to_header())).await?;
    Ok(message.take_body().connect_send(stream))
}
