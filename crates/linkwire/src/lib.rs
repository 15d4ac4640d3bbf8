//! # Linkwire
//!
//! The wire vocabulary spoken by two linked endpoints.
//!
//! ## Architecture
//!
//! - **Values**: `Value` is the closed, dynamically typed stand-in for method
//!   arguments, method results and property values.
//! - **Payloads**: `Payload` wraps a typed request, response or event body under
//!   a stable tag, so handlers are resolved by tag rather than by inspection.
//! - **Codes**: method, property and module names travel as 16-bit codes.
//! - **Messages**: `Message` is the complete set of frames, encoded positionally
//!   (field order is part of the protocol).

pub mod code;
pub mod error;
pub mod message;
pub mod payload;
pub mod value;

pub use code::code;
pub use error::Error;
pub use error::Result;
pub use message::InvokeMethod;
pub use message::InvokeMethodResult;
pub use message::Message;
pub use message::MessageKind;
pub use message::Request;
pub use message::Response;
pub use message::SetProperty;
pub use message::VerificationRequest;
pub use message::VerificationResponse;
pub use message::decode;
pub use message::encode;
pub use payload::Payload;
pub use payload::PayloadType;
pub use value::Value;
