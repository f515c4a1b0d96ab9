use crate::{Error, Result};
use serde_json::Value;
use std::path::Path;

/// Routing and rotation options carried by an event. The first event seen
/// for an app type fixes that consumer's timestamp rule for the process
/// lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub app_type: String,
    pub timestamp_regex: Option<String>,
    pub timestamp_format: Option<String>,
}

pub fn extract_message(event: &Value) -> Result<&str> {
    event
        .get("message")
        .and_then(Value::as_str)
        .ok_or(Error::MissingField("message"))
}

/// The routing key is `fields.s3.appType`, falling back to `fields.appType`
/// and finally the basename of `source`.
pub fn extract_options(event: &Value) -> Result<ConsumerOptions> {
    let fields = event.get("fields");
    let s3 = fields.and_then(|fields| fields.get("s3"));

    let app_type = s3
        .and_then(|s3| s3.get("appType"))
        .and_then(Value::as_str)
        .or_else(|| {
            fields
                .and_then(|fields| fields.get("appType"))
                .and_then(Value::as_str)
        })
        .map(str::to_string)
        .or_else(|| {
            event
                .get("source")
                .and_then(Value::as_str)
                .and_then(source_basename)
        })
        .ok_or(Error::MissingRouting)?;

    Ok(ConsumerOptions {
        app_type,
        timestamp_regex: string_option(s3, "timestampRegex"),
        timestamp_format: string_option(s3, "timestampFormat"),
    })
}

fn string_option(s3: Option<&Value>, key: &str) -> Option<String> {
    s3.and_then(|s3| s3.get(key))
        .and_then(Value::as_str)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn source_basename(source: &str) -> Option<String> {
    Path::new(source)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
}
