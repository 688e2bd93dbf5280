//! Opaque result payloads.
//!
//! Job results, progress payloads and join results all travel as a
//! `ResultPayload`. The engine stores and forwards them without looking inside.
//! Producers and consumers agree on one convention: JSON via `serde_json`.

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::{CoreError, CoreResult};

/// Serialized result blob.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultPayload(String);

impl ResultPayload {
    /// Wrap an already-serialized blob.
    pub fn raw(blob: impl Into<String>) -> Self {
        Self(blob.into())
    }

    /// Serialize a value as JSON.
    pub fn from_json<T: Serialize + ?Sized>(value: &T) -> CoreResult<Self> {
        serde_json::to_string(value)
            .map(Self)
            .map_err(|e| CoreError::invalid_payload(e.to_string()))
    }

    /// Decode the blob as JSON into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> CoreResult<T> {
        serde_json::from_str(&self.0).map_err(|e| CoreError::invalid_payload(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl core::fmt::Display for ResultPayload {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct VmStarted {
        vm_id: u64,
        host: String,
    }

    #[test]
    fn json_payload_decodes_to_original_value() {
        let value = VmStarted {
            vm_id: 7,
            host: "host-3".to_string(),
        };
        let payload = ResultPayload::from_json(&value).unwrap();
        assert_eq!(payload.decode::<VmStarted>().unwrap(), value);
    }

    #[test]
    fn raw_blob_is_kept_verbatim() {
        let payload = ResultPayload::raw("{\"error\":\"boom\"}");
        assert_eq!(payload.as_str(), "{\"error\":\"boom\"}");
        let value: serde_json::Value = payload.decode().unwrap();
        assert_eq!(value["error"], "boom");
    }

    #[test]
    fn decoding_garbage_reports_invalid_payload() {
        let payload = ResultPayload::raw("not json");
        assert!(matches!(
            payload.decode::<VmStarted>(),
            Err(CoreError::InvalidPayload(_))
        ));
    }
}
