//! Pluggable converters between in-memory values and message bodies.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::envelope::JobBatchEnvelope;
use crate::error::SerializationError;

/// Two-way conversion between a value and a message body.
pub trait Converter<T>: Send + Sync {
    fn encode(&self, value: &T) -> Result<Vec<u8>, SerializationError>;
    fn decode(&self, body: &[u8]) -> Result<T, SerializationError>;
}

/// Converter for [`JobBatchEnvelope`]s.
///
/// Besides full conversion it must be able to read the correlation index
/// without materialising the job payloads.
pub trait EnvelopeCodec<J>: Converter<JobBatchEnvelope<J>> {
    fn peek_index(&self, body: &[u8]) -> Option<usize>;
}

/// JSON converter backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonConverter;

impl<T> Converter<T> for JsonConverter
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serde_json::to_vec(value).map_err(|e| SerializationError::Encode {
            what: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }

    fn decode(&self, body: &[u8]) -> Result<T, SerializationError> {
        serde_json::from_slice(body).map_err(|e| SerializationError::Decode {
            what: std::any::type_name::<T>(),
            message: e.to_string(),
        })
    }
}

/// Only the `index` field; everything else is skipped.
#[derive(Deserialize)]
struct IndexProbe {
    #[serde(default)]
    index: Option<usize>,
}

impl<J> EnvelopeCodec<J> for JsonConverter
where
    J: Serialize + DeserializeOwned,
{
    fn peek_index(&self, body: &[u8]) -> Option<usize> {
        serde_json::from_slice::<IndexProbe>(body)
            .ok()
            .and_then(|probe| probe.index)
    }
}

/// Turns a raw delivery body into the text a command processor parses.
pub trait ReceiveConverter: Send + Sync {
    fn convert(&self, body: &[u8]) -> Result<String, SerializationError>;
}

/// Strict UTF-8 decoding; invalid bodies are rejected.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringConverter;

impl ReceiveConverter for StringConverter {
    fn convert(&self, body: &[u8]) -> Result<String, SerializationError> {
        String::from_utf8(body.to_vec()).map_err(|e| SerializationError::Decode {
            what: "message body",
            message: e.to_string(),
        })
    }
}

/// UTF-8 decoding that replaces invalid sequences instead of failing.
#[derive(Debug, Clone, Copy, Default)]
pub struct LossyStringConverter;

impl ReceiveConverter for LossyStringConverter {
    fn convert(&self, body: &[u8]) -> Result<String, SerializationError> {
        Ok(String::from_utf8_lossy(body).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
