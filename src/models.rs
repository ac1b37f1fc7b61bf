//! Data models exchanged with the filesystem engine.
//!
//! These structs mirror the JSON bodies carried inside engine frames.
//! They use serde for (de)serialization; see [`crate::ipc::framing`] for the
//! byte layout around them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ipc::RpcError;

// =============================================================================
// Request Headers
// =============================================================================

/// Lists the entries of a directory.
pub const DIRECTORY_OPEN: &str = "DirectoryOpen";
/// Creates a directory.
pub const DIRECTORY_CREATE: &str = "DirectoryCreate";
/// Creates an empty file.
pub const FILE_CREATE: &str = "FileCreate";
/// Removes a file or directory.
pub const ENTRY_REMOVE: &str = "EntryRemove";
/// Copies an entry to a new location.
pub const ENTRY_COPY: &str = "EntryCopy";
/// Moves an entry to a new location.
pub const ENTRY_MOVE: &str = "EntryMove";
/// Persists the engine's virtual state to disk.
pub const SAVE: &str = "Save";

// =============================================================================
// Request
// =============================================================================

/// A request sent to the engine.
///
/// The `id` is left empty by the typed constructors; the client assigns a
/// fresh one at send time unless the caller pinned one with [`Request::with_id`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub header: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl Request {
    /// Create a request with an empty payload.
    pub fn new(header: impl Into<String>) -> Self {
        Self {
            id: None,
            header: header.into(),
            payload: Map::new(),
        }
    }

    /// Pin the correlation id instead of letting the client generate one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Append a payload parameter. Insertion order is kept on the wire.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }

    pub fn directory_open(path: &str) -> Self {
        Self::new(DIRECTORY_OPEN).with_param("path", path)
    }

    pub fn directory_create(path: &str, recursive: bool, overwrite: bool) -> Self {
        Self::new(DIRECTORY_CREATE)
            .with_param("path", path)
            .with_param("recursive", recursive)
            .with_param("overwrite", overwrite)
    }

    pub fn file_create(path: &str, recursive: bool, overwrite: bool) -> Self {
        Self::new(FILE_CREATE)
            .with_param("path", path)
            .with_param("recursive", recursive)
            .with_param("overwrite", overwrite)
    }

    pub fn entry_remove(path: &str, recursive: bool) -> Self {
        Self::new(ENTRY_REMOVE)
            .with_param("path", path)
            .with_param("recursive", recursive)
    }

    pub fn entry_copy(source: &str, destination: &str, merge: bool, overwrite: bool) -> Self {
        Self::new(ENTRY_COPY)
            .with_param("source", source)
            .with_param("destination", destination)
            .with_param("merge", merge)
            .with_param("overwrite", overwrite)
    }

    pub fn entry_move(source: &str, destination: &str, merge: bool, overwrite: bool) -> Self {
        Self::new(ENTRY_MOVE)
            .with_param("source", source)
            .with_param("destination", destination)
            .with_param("merge", merge)
            .with_param("overwrite", overwrite)
    }

    pub fn save(path: &str, overwrite: bool) -> Self {
        Self::new(SAVE)
            .with_param("path", path)
            .with_param("overwrite", overwrite)
    }
}

// =============================================================================
// Response
// =============================================================================

/// Outcome reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Success,
    Fail,
}

/// Result shape tag for collection replies.
pub const KIND_COLLECTION: &str = "Collection";
/// Result shape tag for single-entry replies.
pub const KIND_ENTRY: &str = "Entry";

/// A filesystem entry as reported by the engine.
///
/// Flags missing on the wire default to `false`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    #[serde(default)]
    pub is_dir: bool,
    #[serde(default)]
    pub is_file: bool,
    #[serde(default)]
    pub is_virtual: bool,
}

/// A reply to a client request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub status: Status,
    #[serde(default, alias = "header", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, alias = "body", skip_serializing_if = "Option::is_none")]
    content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Interpreted body of a successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseResult {
    Collection(Vec<Entry>),
    Entry(Option<Entry>),
    Other(Value),
}

impl Response {
    pub fn success(id: impl Into<String>, kind: impl Into<String>, content: Value) -> Self {
        Self {
            id: Some(id.into()),
            status: Status::Success,
            kind: Some(kind.into()),
            content: Some(content),
            error: None,
        }
    }

    pub fn fail(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            status: Status::Fail,
            kind: None,
            content: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn is_fail(&self) -> bool {
        self.status == Status::Fail
    }

    /// Raw result body. Always `None` for failed responses.
    pub fn content(&self) -> Option<&Value> {
        match self.status {
            Status::Success => self.content.as_ref(),
            Status::Fail => None,
        }
    }

    /// Error text of a failed response, falling back to a string body.
    pub fn error_message(&self) -> &str {
        self.error
            .as_deref()
            .or_else(|| self.content.as_ref().and_then(Value::as_str))
            .unwrap_or("engine reported a failure without a message")
    }

    /// Interpret the body according to `kind`.
    ///
    /// # Errors
    ///
    /// Returns `RpcError::Engine` for failed responses and `RpcError::Protocol`
    /// when the body does not match the announced shape.
    pub fn result(&self) -> Result<ResponseResult, RpcError> {
        if self.is_fail() {
            return Err(RpcError::engine(self.error_message()));
        }

        let content = self.content.clone().unwrap_or(Value::Null);
        match self.kind.as_deref() {
            Some(KIND_COLLECTION) => Ok(ResponseResult::Collection(parse_entries(content)?)),
            Some(KIND_ENTRY) => {
                let entry = match content {
                    Value::Array(_) => parse_entries(content)?.into_iter().next(),
                    Value::Null => None,
                    single => Some(serde_json::from_value(single).map_err(|e| {
                        RpcError::Protocol(format!("Invalid entry in response: {}", e))
                    })?),
                };
                Ok(ResponseResult::Entry(entry))
            }
            _ => Ok(ResponseResult::Other(content)),
        }
    }

    /// Entries of a collection (or single-entry) response.
    pub fn entries(&self) -> Result<Vec<Entry>, RpcError> {
        match self.result()? {
            ResponseResult::Collection(entries) => Ok(entries),
            ResponseResult::Entry(entry) => Ok(entry.into_iter().collect()),
            ResponseResult::Other(_) => Err(RpcError::Protocol(format!(
                "Expected entries, got {} result",
                self.kind.as_deref().unwrap_or("untagged")
            ))),
        }
    }
}

fn parse_entries(content: Value) -> Result<Vec<Entry>, RpcError> {
    match content {
        Value::Null => Ok(Vec::new()),
        other => serde_json::from_value(other)
            .map_err(|e| RpcError::Protocol(format!("Invalid entry collection: {}", e))),
    }
}

// =============================================================================
// Push Messages
// =============================================================================

/// A message pushed by the engine without a matching request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub header: String,
    #[serde(default)]
    pub payload: Value,
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Response(Response),
    Event(Event),
}

impl Inbound {
    /// Correlation id, if the message carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Inbound::Response(response) => response.id.as_deref(),
            Inbound::Event(event) => event.id.as_deref(),
        }
    }

    /// Header naming the payload shape.
    pub fn header(&self) -> &str {
        match self {
            Inbound::Response(response) => response.kind.as_deref().unwrap_or("Response"),
            Inbound::Event(event) => &event.header,
        }
    }

    /// The `path` parameter the message is about, if any.
    ///
    /// Consumers scope delivery by comparing this against their own paths.
    pub fn subject_path(&self) -> Option<&str> {
        match self {
            Inbound::Response(_) => None,
            Inbound::Event(event) => event.payload.get("path").and_then(Value::as_str),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_request_payload_keeps_insertion_order() {
        let request = Request::entry_copy("/a", "/b", true, false);
        let keys: Vec<&str> = request.payload.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["source", "destination", "merge", "overwrite"]);

        let json = serde_json::to_string(&request).unwrap();
        assert_eq!(
            json,
            r#"{"header":"EntryCopy","payload":{"source":"/a","destination":"/b","merge":true,"overwrite":false}}"#
        );
    }

    #[test]
    fn test_request_with_id_serializes_id() {
        let request = Request::directory_open("/home/user").with_id("jsvs2qz26");
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], "jsvs2qz26");
        assert_eq!(value["header"], DIRECTORY_OPEN);
        assert_eq!(value["payload"]["path"], "/home/user");
    }

    #[test]
    fn test_collection_response_parses_entries() {
        let json = r#"{"id":"1","status":"Success","kind":"Collection","content":[{"name":"a","is_dir":true,"is_file":false}]}"#;
        let response: Response = serde_json::from_str(json).unwrap();

        let entries = response.entries().unwrap();
        assert_eq!(
            entries,
            vec![Entry {
                name: "a".to_string(),
                is_dir: true,
                is_file: false,
                is_virtual: false,
            }]
        );
    }

    #[test]
    fn test_entry_response_takes_first_element() {
        let response = Response::success(
            "1",
            KIND_ENTRY,
            json!([{"name": "x", "is_file": true}, {"name": "y"}]),
        );
        match response.result().unwrap() {
            ResponseResult::Entry(Some(entry)) => assert_eq!(entry.name, "x"),
            other => panic!("Expected single entry, got {:?}", other),
        }

        let empty = Response::success("2", KIND_ENTRY, json!([]));
        assert_eq!(empty.result().unwrap(), ResponseResult::Entry(None));
    }

    #[test]
    fn test_fail_response_hides_content() {
        let json = r#"{"id":"1","status":"Fail","content":[{"name":"leak"}],"error":"not found"}"#;
        let response: Response = serde_json::from_str(json).unwrap();

        assert!(response.is_fail());
        assert!(response.content().is_none());
        let err = response.result().unwrap_err();
        assert_eq!(err.to_string(), "not found");
    }

    #[test]
    fn test_fail_response_reads_message_from_body() {
        let json = r#"{"id":"1","status":"Fail","body":"not found"}"#;
        let response: Response = serde_json::from_str(json).unwrap();

        assert_eq!(response.error_message(), "not found");
        let err = response.result().unwrap_err();
        assert_eq!(err.to_string(), "not found");
    }

    #[test]
    fn test_header_and_body_field_names_are_accepted() {
        let json = r#"{"status":"Success","header":"Collection","body":[{"name":"a"}]}"#;
        let response: Response = serde_json::from_str(json).unwrap();

        assert_eq!(response.kind.as_deref(), Some(KIND_COLLECTION));
        let entries = response.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "a");
    }

    #[test]
    fn test_fail_without_message_uses_placeholder() {
        let response: Response = serde_json::from_str(r#"{"status":"Fail","body":[1]}"#).unwrap();
        assert_eq!(
            response.error_message(),
            "engine reported a failure without a message"
        );
    }

    #[test]
    fn test_unknown_kind_is_passed_through() {
        let response = Response::success("1", "SaveReport", json!({"written": 3}));
        assert_eq!(
            response.result().unwrap(),
            ResponseResult::Other(json!({"written": 3}))
        );
        assert!(response.entries().is_err());
    }

    #[test]
    fn test_event_subject_path() {
        let event = Inbound::Event(Event {
            id: None,
            header: "EntryChanged".to_string(),
            payload: json!({"path": "/tmp/a"}),
        });
        assert_eq!(event.header(), "EntryChanged");
        assert_eq!(event.subject_path(), Some("/tmp/a"));
        assert_eq!(event.id(), None);
    }
}
