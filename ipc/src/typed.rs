//! Typed decoding of synchronous replies.
//!
//! A [`ReplyDeserializer`] turns the payload of a reply into the caller's
//! output type. A payload of the wrong shape is reported as
//! [`MalformedReply`]; the channel itself stays usable.

use crate::MessagePayload;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// A reply payload did not have the expected shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedReply {
    pub reason: String,
}

impl MalformedReply {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for MalformedReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed reply: {}", self.reason)
    }
}

impl std::error::Error for MalformedReply {}

/// Decodes a reply payload into typed output.
pub trait ReplyDeserializer {
    /// Decoded output type.
    type Output;

    /// Consumes the reply payload.
    fn deserialize_reply(&self, payload: &MessagePayload) -> Result<Self::Output, MalformedReply>;
}

/// Returns the payload untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawReply;

impl ReplyDeserializer for RawReply {
    type Output = MessagePayload;

    fn deserialize_reply(&self, payload: &MessagePayload) -> Result<MessagePayload, MalformedReply> {
        Ok(payload.clone())
    }
}

/// Decodes the payload as JSON into `T`.
pub struct JsonReply<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonReply<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonReply<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> ReplyDeserializer for JsonReply<T> {
    type Output = T;

    fn deserialize_reply(&self, payload: &MessagePayload) -> Result<T, MalformedReply> {
        payload
            .deserialize::<T>()
            .map_err(|err| MalformedReply::new(err.to_string()))
    }
}
