use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;

/// Opaque bytes crossing the engine boundary.
///
/// The engine never interprets payload contents; workflow code and the
/// transport agree on the encoding. JSON helpers are provided because that
/// is what the in-process driver and the tests use.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Create a payload from raw bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// Serialize a value as JSON bytes.
    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Deserialize the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.bytes)
    }

    /// UTF-8 text payload.
    pub fn text(s: &str) -> Self {
        Self {
            bytes: s.as_bytes().to_vec(),
        }
    }

    /// Borrow the payload as UTF-8 text, if it is valid UTF-8.
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}
