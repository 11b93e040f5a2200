//! Measurement record codec
//!
//! Control messages and terminal output travel as SenML-style JSON packs: an
//! ordered array of records. Only the string value is meaningful to the agent,
//! every other field is optional and carried as-is.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload is not a measurement array")]
    NotAnArray,
    #[error("invalid measurement payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// One measurement record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "bn", default, skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
    #[serde(rename = "bt", default, skip_serializing_if = "Option::is_none")]
    pub base_time: Option<f64>,
    #[serde(rename = "bu", default, skip_serializing_if = "Option::is_none")]
    pub base_unit: Option<String>,
    #[serde(rename = "bver", default, skip_serializing_if = "Option::is_none")]
    pub base_version: Option<u32>,
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(rename = "vs", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    #[serde(rename = "vb", default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
    #[serde(rename = "vd", default, skip_serializing_if = "Option::is_none")]
    pub data_value: Option<String>,
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

impl Record {
    /// Effective measurement key: base name followed by name.
    pub fn key(&self) -> String {
        format!(
            "{}{}",
            self.base_name.as_deref().unwrap_or_default(),
            self.name.as_deref().unwrap_or_default()
        )
    }
}

/// Seconds since the epoch with microsecond precision.
pub fn now_seconds() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Builds a one-record pack `{bn: id, n: name, t: now, vs: value}`.
pub fn encode(id: &str, name: &str, value: &str) -> Result<Vec<u8>, CodecError> {
    let record = Record {
        base_name: Some(id.to_string()),
        name: Some(name.to_string()),
        time: Some(now_seconds()),
        string_value: Some(value.to_string()),
        ..Default::default()
    };
    Ok(serde_json::to_vec(&[record])?)
}

/// Parses a pack. A base name applies to the records that follow it until a
/// new one appears, so every returned record carries its resolved base name.
pub fn decode(payload: &[u8]) -> Result<Vec<Record>, CodecError> {
    let value: serde_json::Value = serde_json::from_slice(payload)?;
    if !value.is_array() {
        return Err(CodecError::NotAnArray);
    }
    let mut records: Vec<Record> = serde_json::from_value(value)?;

    let mut base_name: Option<String> = None;
    for record in records.iter_mut() {
        match &record.base_name {
            Some(bn) => base_name = Some(bn.clone()),
            None => record.base_name = base_name.clone(),
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reverses_encode() {
        let payload = encode("42:", "config", "view").unwrap();
        let records = decode(&payload).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key(), "42:config");
        assert_eq!(records[0].string_value.as_deref(), Some("view"));
    }

    #[test]
    fn encode_stamps_fractional_time() {
        let before = now_seconds();
        let records = decode(&encode("a", "b", "c").unwrap()).unwrap();
        let t = records[0].time.unwrap();
        assert!(t >= before.floor());
        assert!(t > 1_000_000_000.0);
    }

    #[test]
    fn optional_fields_are_tolerated() {
        let payload = br#"[{"bn":"1:","n":"config","vs":"view"},{"n":"temp","v":21.5,"u":"Cel"}]"#;
        let records = decode(payload).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].value, None);
        assert_eq!(records[0].bool_value, None);
        assert_eq!(records[1].value, Some(21.5));
        assert_eq!(records[1].key(), "1:temp");
    }

    #[test]
    fn structurally_invalid_payloads_fail() {
        assert!(matches!(decode(br#"{"bn":"1"}"#), Err(CodecError::NotAnArray)));
        assert!(matches!(decode(b"not json"), Err(CodecError::Json(_))));
        assert!(matches!(decode(br#"[{"vs": 5}]"#), Err(CodecError::Json(_))));
    }

    #[test]
    fn empty_pack_decodes() {
        assert!(decode(b"[]").unwrap().is_empty());
    }
}
