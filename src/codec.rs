use serde::{Serialize, de::DeserializeOwned};

/// Turns event data and aggregate state into stored bytes and back.
///
/// The repository is generic over its codec so the wire format stays a
/// deployment choice. Failures are reported as `anyhow::Error` and wrapped by
/// the record layer into [`EsError::PayloadEncode`](crate::EsError::PayloadEncode)
/// or [`EsError::PayloadDecode`](crate::EsError::PayloadDecode).
pub trait PayloadCodec: Clone + Send + Sync + 'static {
    fn encode<T>(&self, value: &T) -> anyhow::Result<Vec<u8>>
    where
        T: Serialize + ?Sized;

    fn decode<T>(&self, bytes: &[u8]) -> anyhow::Result<T>
    where
        T: DeserializeOwned;
}

/// JSON payloads via `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T>(&self, value: &T) -> anyhow::Result<Vec<u8>>
    where
        T: Serialize + ?Sized,
    {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T>(&self, bytes: &[u8]) -> anyhow::Result<T>
    where
        T: DeserializeOwned,
    {
        Ok(serde_json::from_slice(bytes)?)
    }
}
