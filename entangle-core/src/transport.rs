//! # Transport
//!
//! The engine talks to the network through the [Transport] trait and turns documents into
//! protocol text through a [Stringifier]. Concrete HTTP/WebSocket adapters live outside the
//! crate; [MockTransport] is a scriptable in-memory transport for tests and demos.

use std::collections::{HashMap, VecDeque};
use std::fmt::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error as ThisError;
use tokio::sync::mpsc::UnboundedSender;

use crate::data::Data;
use crate::document::{Derive, Document, Field, NodeId, OperationKind};
use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ResponseError {
    pub message: String,
    #[serde(default)]
    pub path: Vec<Data>,
}

/// Response envelope of the protocol: `{data, errors}`.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct TransportResponse {
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub errors: Vec<ResponseError>,
}

impl TransportResponse {
    pub fn data(data: Data) -> Self {
        TransportResponse {
            data,
            errors: Vec::new(),
        }
    }

    pub fn error(message: &str) -> Self {
        TransportResponse {
            data: Data::Null,
            errors: vec![ResponseError {
                message: message.to_owned(),
                path: Vec::new(),
            }],
        }
    }

    /// Response data, or a protocol error carrying the operation and variables.
    pub fn into_result(self, operation: &str, variables: &Data) -> Result<Data, Error> {
        if self.errors.is_empty() {
            Ok(self.data)
        } else {
            let messages: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
            Err(Error::protocol(operation, variables, &messages))
        }
    }
}

#[derive(ThisError, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("streaming is not supported by this transport")]
    StreamingNotSupported,
}

impl From<TransportError> for Error {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::StreamingNotSupported => Error::not_supported(error.to_string()),
            _ => Error::transport(error),
        }
    }
}

/// Receiving end of a streaming operation.
pub type StreamSink = UnboundedSender<TransportResponse>;

/// Closes a stream when closed explicitly or dropped.
pub struct StreamHandle {
    close: Option<Box<dyn FnOnce() + Send>>,
}

impl StreamHandle {
    pub fn new<F: FnOnce() + Send + 'static>(close: F) -> Self {
        StreamHandle {
            close: Some(Box::new(close)),
        }
    }

    pub fn close(mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Request/response call. Dropping the future cancels the request.
    async fn send(&self, operation: &str, variables: &Data) -> Result<TransportResponse, TransportError>;

    /// Streaming call; payloads are pushed into the sink until the handle is closed.
    fn subscribe(
        &self,
        _operation: &str,
        _variables: &Data,
        _sink: StreamSink,
    ) -> Result<StreamHandle, TransportError> {
        Err(TransportError::StreamingNotSupported)
    }
}

pub trait Stringifier: Send + Sync {
    fn stringify(&self, document: &Document) -> String;
}

/// Default [Stringifier], rendering a document as GraphQL-like text from its descriptor.
///
/// Real protocol text is produced by the document's code generator and handed to the client
/// through [Environment::with_stringifier](crate::context::Environment::with_stringifier);
/// this rendering serves tests and clients without one. Derived fields are not sent to the
/// server, except that a field derived from a reference selects the reference itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentStringifier;

impl DocumentStringifier {
    fn selection(&self, document: &Document, node: NodeId, out: &mut String) {
        let descriptor = document.node(node);
        out.push_str(" {");
        for field in document.fields(node, None) {
            match field {
                Field::Scalar(scalar) => {
                    let _ = write!(out, " {}", self.server_name(document, node, &scalar.name));
                }
                Field::Virtual(_, _) => {}
                Field::Object(name, child) => match document.node(child).derive {
                    Some(Derive::FromReference(_)) => {
                        // the reference may already be selected under a renamed scalar
                        if !descriptor.scalars.iter().any(|s| s.name == name) {
                            let _ = write!(out, " {}", name);
                        }
                    }
                    Some(_) => {}
                    None => {
                        let _ = write!(out, " {}", name);
                        self.selection(document, child, out);
                    }
                },
            }
        }
        for (typename, overlay) in descriptor.fragments.iter() {
            let _ = write!(out, " ... on {}", typename);
            self.selection(document, *overlay, out);
        }
        out.push_str(" }");
    }

    fn server_name<'a>(&self, document: &'a Document, node: NodeId, name: &'a str) -> &'a str {
        document
            .node(node)
            .references
            .iter()
            .find(|(_, client)| client == name)
            .map(|(server, _)| server.as_str())
            .unwrap_or(name)
    }
}

impl Stringifier for DocumentStringifier {
    fn stringify(&self, document: &Document) -> String {
        let keyword = match document.operation_kind() {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        };
        let mut out = format!("{} {}", keyword, document.name());
        self.selection(document, document.root(), &mut out);
        out
    }
}

type Handler = Arc<dyn Fn(&str, &Data) -> TransportResponse + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory transport answering from scripted responses.
///
/// Responses are looked up by the canonical text of the variables: a queue of responses is
/// consumed in order and its last element repeats. A handler, if set, takes precedence.
#[derive(Default)]
pub struct MockTransport {
    scripted: Mutex<HashMap<String, VecDeque<TransportResponse>>>,
    fallback: Mutex<Option<TransportResponse>>,
    handler: Option<Handler>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<(String, Data)>>,
    streams: Mutex<Vec<StreamSink>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(self, variables: &Data, data: Data) -> Self {
        self.respond(variables, TransportResponse::data(data));
        self
    }

    pub fn with_fallback(self, data: Data) -> Self {
        *lock(&self.fallback) = Some(TransportResponse::data(data));
        self
    }

    pub fn with_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &Data) -> TransportResponse + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Queues a response for a variables binding.
    pub fn respond(&self, variables: &Data, response: TransportResponse) {
        lock(&self.scripted)
            .entry(variables.canonical_string())
            .or_default()
            .push_back(response);
    }

    /// Replaces all queued responses for a variables binding.
    pub fn set_response(&self, variables: &Data, response: TransportResponse) {
        lock(&self.scripted).insert(variables.canonical_string(), VecDeque::from([response]));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<(String, Data)> {
        lock(&self.requests).clone()
    }

    /// Pushes a payload into every open stream; returns how many received it.
    pub fn push_stream(&self, payload: Data) -> usize {
        let mut streams = lock(&self.streams);
        streams.retain(|sink| sink.send(TransportResponse::data(payload.clone())).is_ok());
        streams.len()
    }

    pub fn open_streams(&self) -> usize {
        let mut streams = lock(&self.streams);
        streams.retain(|sink| !sink.is_closed());
        streams.len()
    }

    fn next_response(&self, operation: &str, variables: &Data) -> Result<TransportResponse, TransportError> {
        if let Some(handler) = &self.handler {
            return Ok(handler(operation, variables));
        }
        let mut scripted = lock(&self.scripted);
        if let Some(queue) = scripted.get_mut(&variables.canonical_string()) {
            let response = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(response) = response {
                return Ok(response);
            }
        }
        lock(&self.fallback).clone().ok_or_else(|| {
            TransportError::InvalidResponse(format!(
                "no response scripted for {}",
                variables.canonical_string()
            ))
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, operation: &str, variables: &Data) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.requests).push((operation.to_owned(), variables.clone()));
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.next_response(operation, variables)
    }

    fn subscribe(
        &self,
        operation: &str,
        variables: &Data,
        sink: StreamSink,
    ) -> Result<StreamHandle, TransportError> {
        lock(&self.requests).push((operation.to_owned(), variables.clone()));
        lock(&self.streams).push(sink);
        Ok(StreamHandle::new(|| {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{DeriveFetcher, DeriveRequest, NodeSpec};
    use serde_json::json;

    struct Unused;

    #[async_trait]
    impl DeriveFetcher for Unused {
        async fn fetch(&self, _request: DeriveRequest) -> Result<Data, Error> {
            Ok(Data::Null)
        }
    }

    #[test]
    fn test_protocol_errors() {
        let response = TransportResponse::error("denied");
        let e = response.into_result("UserQuery", &Data::Null).unwrap_err();
        assert_eq!(e.error_type, crate::error::ErrorType::Protocol);
        let ok = TransportResponse::data(Data::from(1)).into_result("UserQuery", &Data::Null);
        assert_eq!(ok.unwrap(), Data::from(1));
    }

    #[test]
    fn test_stringify() {
        let doc = Document::query(
            "UserQuery",
            NodeSpec::root().object(
                "user",
                NodeSpec::entity("User")
                    .scalar("name")
                    .reference("author_id", "authorId")
                    .virtual_scalar("selected", Data::Bool(false))
                    .object(
                        "pet",
                        NodeSpec::union().fragment("Dog", NodeSpec::embed().scalar("barks")),
                    ),
            ),
        );
        assert_eq!(
            DocumentStringifier.stringify(&doc),
            "query UserQuery { user { id __typename name author_id pet { id __typename ... on Dog { barks } } } }"
        );
    }

    #[test]
    fn test_stringify_derived_fields() {
        let doc = Document::query(
            "Post",
            NodeSpec::root().object(
                "post",
                NodeSpec::entity("Post")
                    .scalar("title")
                    .object("author", NodeSpec::entity("User").derive_from_reference(Arc::new(Unused)))
                    .reference("editor_id", "editor")
                    .object("editor", NodeSpec::entity("User").derive_from_reference(Arc::new(Unused)))
                    .object(
                        "reviewer",
                        NodeSpec::entity("User").derive_from_foreign_key("reviewerId", Arc::new(Unused)),
                    )
                    .object("locale", NodeSpec::embed().derive_from(Arc::new(Unused))),
            ),
        );
        assert_eq!(
            DocumentStringifier.stringify(&doc),
            "query Post { post { id __typename title editor_id author } }"
        );
    }

    #[tokio::test]
    async fn test_mock_transport_script() {
        let vars = Data::from(json!({"id": 1}));
        let transport = MockTransport::new().with_response(&vars, Data::from("first"));
        transport.respond(&vars, TransportResponse::data(Data::from("second")));
        assert_eq!(transport.send("Q", &vars).await.unwrap().data, Data::from("first"));
        assert_eq!(transport.send("Q", &vars).await.unwrap().data, Data::from("second"));
        assert_eq!(transport.send("Q", &vars).await.unwrap().data, Data::from("second"));
        assert!(transport.send("Q", &Data::Null).await.is_err());
        assert_eq!(transport.calls(), 4);
    }
}
