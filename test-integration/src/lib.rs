//! Helpers shared by the end-to-end scenarios in `tests/`

use anyhow::{anyhow, Result};
use gateway_agent::heartbeat::ServiceInfo;
use gateway_agent::senml::Record;

/// Services listed in a `config view` response record
pub fn services_in(record: &Record) -> Result<Vec<ServiceInfo>> {
    let value = record
        .string_value
        .as_deref()
        .ok_or_else(|| anyhow!("response record has no value"))?;
    Ok(serde_json::from_str(value)?)
}

/// `(kind, message)` of an error response record
pub fn error_in(record: &Record) -> Result<(String, String)> {
    let value = record
        .string_value
        .as_deref()
        .ok_or_else(|| anyhow!("error record has no value"))?;
    let body: serde_json::Value = serde_json::from_str(value)?;
    let kind = body["kind"].as_str().unwrap_or_default().to_string();
    let message = body["message"].as_str().unwrap_or_default().to_string();
    Ok((kind, message))
}

/// True if any record of a terminal output pack contains `needle`
pub fn output_contains(records: &[Record], needle: &str) -> bool {
    records
        .iter()
        .any(|r| r.string_value.as_deref().is_some_and(|v| v.contains(needle)))
}
