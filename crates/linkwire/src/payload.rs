//! # Tagged Payloads
//!
//! Request, response and event bodies are application types. On the wire they
//! travel as a `Payload`: the body's stable tag next to its encoded bytes.
//! Handler tables key on the tag, so dispatch never needs to look inside.

use serde::Deserialize;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::Error;
use crate::error::Result;

/// A type that can travel as a request, response or event body.
///
/// `TAG` must be unique among the payload types two endpoints exchange and
/// must not change between releases, since both sides key handlers on it.
pub trait PayloadType: Serialize + DeserializeOwned + Send + 'static {
    const TAG: &'static str;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub tag: String,
    pub data: Vec<u8>,
}

impl Payload {
    /// Encodes `body` under its type's tag.
    pub fn pack<T: PayloadType>(body: &T) -> Result<Self> {
        let data = bincode::serialize(body).map_err(|e| Error::Encode(e.to_string()))?;
        Ok(Self { tag: T::TAG.to_string(), data })
    }

    /// Decodes the body as `T`, checking the tag first.
    pub fn unpack<T: PayloadType>(&self) -> Result<T> {
        if !self.is::<T>() {
            return Err(Error::UnknownTag {
                expected: T::TAG.to_string(),
                found: self.tag.clone(),
            });
        }
        bincode::deserialize(&self.data).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn is<T: PayloadType>(&self) -> bool {
        self.tag == T::TAG
    }
}
