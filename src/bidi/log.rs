//! Event types for the `log` module.

use serde::Serialize;

use crate::bidi::script::Source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl Level {
    /// Map a CDP `Runtime.consoleAPICalled` type onto a log level.
    pub fn from_console_method(method: &str) -> Self {
        match method {
            "debug" | "trace" => Level::Debug,
            "warning" => Level::Warn,
            "error" | "assert" => Level::Error,
            _ => Level::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub level: Level,
    pub source: Source,
    pub text: Option<String>,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<serde_json::Value>,
}
