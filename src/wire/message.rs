//! Jupyter message model.

use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::types::{Error, MessageId, Result, SessionId};

/// Messaging protocol version spoken by this kernel.
pub const PROTOCOL_VERSION: &str = "5.3";

// Shell/control requests and replies.
pub const KERNEL_INFO_REQUEST: &str = "kernel_info_request";
pub const KERNEL_INFO_REPLY: &str = "kernel_info_reply";
pub const EXECUTE_REQUEST: &str = "execute_request";
pub const EXECUTE_REPLY: &str = "execute_reply";
pub const COMPLETE_REQUEST: &str = "complete_request";
pub const COMPLETE_REPLY: &str = "complete_reply";
pub const SHUTDOWN_REQUEST: &str = "shutdown_request";
pub const SHUTDOWN_REPLY: &str = "shutdown_reply";

// IOPub broadcasts.
pub const STATUS: &str = "status";
pub const STREAM: &str = "stream";
pub const EXECUTE_INPUT: &str = "execute_input";
pub const EXECUTE_RESULT: &str = "execute_result";
pub const ERROR: &str = "error";
pub const DISPLAY_DATA: &str = "display_data";
pub const UPDATE_DISPLAY_DATA: &str = "update_display_data";

/// Message header.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Header {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub date: String,
    pub msg_type: String,
    pub version: String,
}

impl Header {
    /// Fresh header: new message id, current timestamp.
    pub fn new(msg_type: &str, session: &str, username: &str) -> Self {
        Self {
            msg_id: MessageId::new().to_string(),
            session: session.to_string(),
            username: username.to_string(),
            date: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
        }
    }
}

/// The four JSON frames a message was decoded from, kept verbatim.
#[derive(Debug, Clone)]
pub(crate) struct ReceivedFrames {
    pub(crate) header: Bytes,
    pub(crate) parent_header: Bytes,
    pub(crate) metadata: Bytes,
    pub(crate) content: Bytes,
}

/// A decoded wire message plus the routing identities it arrived with.
///
/// A decoded message remembers its JSON frames; re-encoding emits a received
/// frame unchanged as long as the corresponding field still holds the value
/// decoded from it.
#[derive(Debug, Clone)]
pub struct ComposedMessage {
    /// Socket identity frames needed to route a reply back.
    pub identities: Vec<Bytes>,
    pub header: Header,
    /// `None` is sent as `{}`.
    pub parent_header: Option<Header>,
    pub metadata: Map<String, Value>,
    pub content: Value,
    /// Binary attachment frames following the JSON frames.
    pub buffers: Vec<Bytes>,
    pub(crate) received: Option<ReceivedFrames>,
}

impl PartialEq for ComposedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.identities == other.identities
            && self.header == other.header
            && self.parent_header == other.parent_header
            && self.metadata == other.metadata
            && self.content == other.content
            && self.buffers == other.buffers
    }
}

impl ComposedMessage {
    /// New top-level message with no parent.
    pub fn new(msg_type: &str, session: &SessionId, username: &str, content: Value) -> Self {
        Self {
            identities: Vec::new(),
            header: Header::new(msg_type, session.as_str(), username),
            parent_header: None,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            received: None,
        }
    }

    /// Reply to this message: inherits session and username, threads this
    /// message's header as parent and keeps its routing identities.
    pub fn reply(&self, msg_type: &str, content: Value) -> Self {
        Self {
            identities: self.identities.clone(),
            ..self.derive(msg_type, content)
        }
    }

    /// Message caused by this one but not routed back to its sender (iopub
    /// broadcasts). The topic frame is the message type.
    pub fn derive(&self, msg_type: &str, content: Value) -> Self {
        Self {
            identities: vec![Bytes::from(msg_type.to_string())],
            header: Header::new(msg_type, &self.header.session, &self.header.username),
            parent_header: Some(self.header.clone()),
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
            received: None,
        }
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Required string field of `content`.
    pub fn content_str(&self, key: &str) -> Result<&str> {
        self.content
            .get(key)
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol(format!("{}: missing string field {:?}", self.msg_type(), key)))
    }

    /// Optional boolean field of `content`, `false` when absent.
    pub fn content_bool(&self, key: &str) -> Result<bool> {
        match self.content.get(key) {
            None | Some(Value::Null) => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(other) => Err(Error::protocol(format!(
                "{}: field {:?} is not a boolean: {}",
                self.msg_type(),
                key,
                other
            ))),
        }
    }

    /// Required non-negative integer field of `content`.
    pub fn content_usize(&self, key: &str) -> Result<usize> {
        self.content
            .get(key)
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .ok_or_else(|| Error::protocol(format!("{}: missing integer field {:?}", self.msg_type(), key)))
    }
}
