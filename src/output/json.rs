use anyhow::{Context, Result};
use serde::Serialize;

pub fn to_pretty<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).context("serialize output as JSON")
}
