//! Plaintext message bodies.
//!
//! A [`Body`] is what an application hands to a sender for encryption and
//! what a receiver yields after successful decryption. Bodies are encoded
//! with MessagePack before sealing.

use serde::{Deserialize, Serialize};

use crate::codec::ProtocolError;

/// An encodable message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Body {
    /// UTF-8 text.
    Text(String),
    /// Opaque bytes.
    Binary(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Structured JSON value.
    Json(serde_json::Value),
}

impl Body {
    /// Encode the body to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if MessagePack encoding fails.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode a body from bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes are not a valid encoded body.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Ok(rmp_serde::from_slice(data)?)
    }

    /// Get the text content, if this is a text body.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Get the raw bytes, if this is a binary body.
    #[must_use]
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Binary(data) => Some(data),
            _ => None,
        }
    }

    /// Get the JSON value, if this is a JSON body.
    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Body::Json(value) => Some(value),
            _ => None,
        }
    }
}

impl From<&str> for Body {
    fn from(text: &str) -> Self {
        Body::Text(text.to_string())
    }
}

impl From<String> for Body {
    fn from(text: String) -> Self {
        Body::Text(text)
    }
}

impl From<Vec<u8>> for Body {
    fn from(data: Vec<u8>) -> Self {
        Body::Binary(data)
    }
}

impl From<serde_json::Value> for Body {
    fn from(value: serde_json::Value) -> Self {
        Body::Json(value)
    }
}
