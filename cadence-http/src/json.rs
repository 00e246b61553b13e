use serde::{de::DeserializeOwned, Serialize};
use serde_json::Result as JsonResult;

pub(crate) fn from_bytes<T: DeserializeOwned>(bytes: &[u8]) -> JsonResult<T> {
    serde_json::from_slice(bytes)
}

pub(crate) fn to_vec<T: Serialize>(value: &T) -> JsonResult<Vec<u8>> {
    serde_json::to_vec(value)
}
