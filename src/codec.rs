//! Key and value serialization for state stores.
//!
//! The replication machinery itself only moves bytes around; codecs
//! are handed to stores through the [`crate::context::ProcessorContext`]
//! so whoever reads a store can turn bytes back into values.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;

use crate::errors::BoxError;

/// Serialization used for a store's keys or values.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Serde {
    /// JSON encoded.
    #[default]
    Json,
    /// UTF-8 text, stored as a JSON string would decode it.
    Utf8,
    /// Bytes as-is.
    Raw,
}

impl Serde {
    /// Serialize an object into bytes a store can hold.
    pub fn ser<T: Serialize>(&self, obj: &T) -> Result<Vec<u8>, BoxError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(obj)?),
            Self::Utf8 => match serde_json::to_value(obj)? {
                serde_json::Value::String(s) => Ok(s.into_bytes()),
                other => Err(format!("utf8 serde can only encode strings, got {other}").into()),
            },
            Self::Raw => match serde_json::to_value(obj)? {
                serde_json::Value::Array(items) => items
                    .into_iter()
                    .map(|item| {
                        item.as_u64()
                            .and_then(|b| u8::try_from(b).ok())
                            .ok_or_else(|| BoxError::from("raw serde can only encode bytes"))
                    })
                    .collect(),
                other => Err(format!("raw serde can only encode bytes, got {other}").into()),
            },
        }
    }

    /// Deserialize bytes read from a store.
    pub fn de<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, BoxError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Utf8 => {
                let s = std::str::from_utf8(bytes)?;
                Ok(serde_json::from_value(serde_json::Value::String(s.to_string()))?)
            }
            Self::Raw => Ok(serde_json::from_value(serde_json::Value::from(bytes))?),
        }
    }
}

#[test]
fn json_round_trips() {
    let bytes = Serde::Json.ser(&(1u32, "a")).unwrap();
    assert_eq!(bytes, br#"[1,"a"]"#);
    let found: (u32, String) = Serde::Json.de(&bytes).unwrap();
    assert_eq!(found, (1, "a".to_string()));
}

#[test]
fn utf8_is_plain_text() {
    let bytes = Serde::Utf8.ser(&"hello").unwrap();
    assert_eq!(bytes, b"hello");
    let found: String = Serde::Utf8.de(b"hello").unwrap();
    assert_eq!(found, "hello");
    assert!(Serde::Utf8.ser(&5).is_err());
    assert!(Serde::Utf8.de::<String>(&[0xff, 0xfe]).is_err());
}

#[test]
fn raw_passes_bytes_through() {
    let bytes = Serde::Raw.ser(&vec![0u8, 7, 255]).unwrap();
    assert_eq!(bytes, vec![0, 7, 255]);
    let found: Vec<u8> = Serde::Raw.de(&bytes).unwrap();
    assert_eq!(found, vec![0, 7, 255]);
    assert!(Serde::Raw.ser(&"text").is_err());
}

#[test]
fn serde_names_are_snake_case() {
    let found: Serde = serde_json::from_str(r#""utf8""#).unwrap();
    assert_eq!(found, Serde::Utf8);
    assert_eq!(Serde::default(), Serde::Json);
}
