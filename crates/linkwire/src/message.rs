//! # Protocol Messages
//!
//! Every frame exchanged between two endpoints.
//!
//! ## Invariants
//! - **Positional Encoding**: fields are written in declaration order, so the
//!   order below is part of the protocol and must not be rearranged.
//! - **Panic Safety**: `decode` returns `Err` on any malformed input.

use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;
use crate::payload::Payload;
use crate::value::Value;

/// Sent by the accepting side right after connect. Carries the
/// transport-assigned token of the connection as the challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRequest {
    pub challenge_token: String,
}

/// The initiating side's answer, announcing who it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResponse {
    pub name: String,
    pub id: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeMethod {
    pub module_code: u16,
    pub method_code: u16,
    pub invocation_id: i32,
    pub args: Vec<Value>,
}

/// Reply to an `InvokeMethod`. `exception` is set when the method failed on
/// the remote side, in which case `value` is `None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeMethodResult {
    pub invocation_id: i32,
    pub value: Option<Value>,
    pub exception: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetProperty {
    pub module_code: u16,
    pub property_code: u16,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: String,
    pub success: bool,
    pub payload: Option<Payload>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    VerificationRequest(VerificationRequest),
    VerificationResponse(VerificationResponse),
    InvokeMethod(InvokeMethod),
    InvokeMethodResult(InvokeMethodResult),
    SetProperty(SetProperty),
    Request(Request),
    Response(Response),
    /// An application-defined one-way message.
    Event(Payload),
}

/// The variant of a `Message`, without its fields.
#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum MessageKind {
    VerificationRequest,
    VerificationResponse,
    InvokeMethod,
    InvokeMethodResult,
    SetProperty,
    Request,
    Response,
    Event,
}

impl MessageKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::VerificationRequest => "VerificationRequest",
            Self::VerificationResponse => "VerificationResponse",
            Self::InvokeMethod => "InvokeMethod",
            Self::InvokeMethodResult => "InvokeMethodResult",
            Self::SetProperty => "SetProperty",
            Self::Request => "Request",
            Self::Response => "Response",
            Self::Event => "Event",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::VerificationRequest(_) => MessageKind::VerificationRequest,
            Self::VerificationResponse(_) => MessageKind::VerificationResponse,
            Self::InvokeMethod(_) => MessageKind::InvokeMethod,
            Self::InvokeMethodResult(_) => MessageKind::InvokeMethodResult,
            Self::SetProperty(_) => MessageKind::SetProperty,
            Self::Request(_) => MessageKind::Request,
            Self::Response(_) => MessageKind::Response,
            Self::Event(_) => MessageKind::Event,
        }
    }

    /// The payload tag of an `Event`, `None` for every other variant.
    pub fn event_tag(&self) -> Option<&str> {
        match self {
            Self::Event(payload) => Some(&payload.tag),
            _ => None,
        }
    }
}

impl From<VerificationRequest> for Message {
    fn from(m: VerificationRequest) -> Self {
        Self::VerificationRequest(m)
    }
}

impl From<VerificationResponse> for Message {
    fn from(m: VerificationResponse) -> Self {
        Self::VerificationResponse(m)
    }
}

impl From<InvokeMethod> for Message {
    fn from(m: InvokeMethod) -> Self {
        Self::InvokeMethod(m)
    }
}

impl From<InvokeMethodResult> for Message {
    fn from(m: InvokeMethodResult) -> Self {
        Self::InvokeMethodResult(m)
    }
}

impl From<SetProperty> for Message {
    fn from(m: SetProperty) -> Self {
        Self::SetProperty(m)
    }
}

impl From<Request> for Message {
    fn from(m: Request) -> Self {
        Self::Request(m)
    }
}

impl From<Response> for Message {
    fn from(m: Response) -> Self {
        Self::Response(m)
    }
}

// ============================================================================
//  WIRE ENCODING
// ============================================================================

/// Encodes a message into a single frame body.
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    bincode::serialize(message).map_err(|e| Error::Encode(e.to_string()))
}

/// Decodes a frame body produced by `encode`.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    bincode::deserialize(bytes).map_err(|e| Error::Decode(e.to_string()))
}
