//! The BiDi side of the wire: command envelopes, outgoing messages and the
//! event-name registry. Payload types for the individual modules live in the
//! submodules; everything is plain serde over `serde_json::Value` beyond the
//! typed layer, matching how commands travel as `(method, params)` pairs.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

pub mod browsing_context;
pub mod input;
pub mod log;
pub mod network;
pub mod script;
pub mod session;
pub mod storage;

/// A single inbound client command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandEnvelope {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Everything the core hands back to the transport.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OutgoingMessage {
    Result {
        id: u64,
        result: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        error: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        stacktrace: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
    Event {
        #[serde(rename = "type")]
        kind: &'static str,
        method: String,
        params: serde_json::Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
    },
}

impl OutgoingMessage {
    pub fn result(id: u64, result: serde_json::Value, channel: Option<String>) -> Self {
        OutgoingMessage::Result {
            id,
            result,
            channel,
        }
    }

    pub fn error(id: Option<u64>, err: &Error, channel: Option<String>) -> Self {
        OutgoingMessage::Error {
            id,
            error: err.code().to_string(),
            message: err.to_string(),
            stacktrace: None,
            channel,
        }
    }

    pub fn event(method: impl Into<String>, params: serde_json::Value, channel: Option<String>) -> Self {
        OutgoingMessage::Event {
            kind: "event",
            method: method.into(),
            params,
            channel,
        }
    }
}

/// Module prefix used for the raw CDP passthrough events
/// (`goog:cdp.<Domain>.<event>`).
pub const CDP_MODULE: &str = "goog:cdp";

pub static BROWSING_CONTEXT_EVENTS: &[&str] = &[
    "browsingContext.contextCreated",
    "browsingContext.contextDestroyed",
    "browsingContext.domContentLoaded",
    "browsingContext.downloadWillBegin",
    "browsingContext.fragmentNavigated",
    "browsingContext.historyUpdated",
    "browsingContext.load",
    "browsingContext.navigationAborted",
    "browsingContext.navigationFailed",
    "browsingContext.navigationStarted",
    "browsingContext.userPromptClosed",
    "browsingContext.userPromptOpened",
];

pub static INPUT_EVENTS: &[&str] = &["input.fileDialogOpened"];

pub static LOG_EVENTS: &[&str] = &["log.entryAdded"];

pub static NETWORK_EVENTS: &[&str] = &[
    "network.authRequired",
    "network.beforeRequestSent",
    "network.fetchError",
    "network.responseCompleted",
    "network.responseStarted",
];

pub static SCRIPT_EVENTS: &[&str] = &[
    "script.message",
    "script.realmCreated",
    "script.realmDestroyed",
];

/// Expand a module name to its atomic events, in enumeration order. The
/// `goog:cdp` module is not statically enumerable and returns `None`; the
/// subscription map keeps it as a prefix sentinel instead.
pub fn expand_module(module: &str) -> Option<&'static [&'static str]> {
    match module {
        "browsingContext" => Some(BROWSING_CONTEXT_EVENTS),
        "input" => Some(INPUT_EVENTS),
        "log" => Some(LOG_EVENTS),
        "network" => Some(NETWORK_EVENTS),
        "script" => Some(SCRIPT_EVENTS),
        _ => None,
    }
}

pub fn is_module(name: &str) -> bool {
    name == CDP_MODULE || expand_module(name).is_some()
}

/// The module prefix of an event name, `goog:cdp.Page.frameNavigated`
/// included.
pub fn module_of(event: &str) -> &str {
    if let Some(rest) = event.strip_prefix(CDP_MODULE) {
        if rest.starts_with('.') {
            return CDP_MODULE;
        }
    }
    event.split('.').next().unwrap_or(event)
}

/// Whether a name is subscribable: a known module, a known atomic event, or
/// any `goog:cdp.`-prefixed event.
pub fn is_subscribable(name: &str) -> bool {
    if is_module(name) {
        return true;
    }
    if name.starts_with("goog:cdp.") {
        return true;
    }
    expand_module(module_of(name))
        .map(|events| events.contains(&name))
        .unwrap_or(false)
}

/// Milliseconds since the unix epoch, the timestamp unit of every emitted
/// event.
pub fn timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn module_expansion_order_is_stable() {
        let events = expand_module("network").unwrap();
        assert_eq!(events[0], "network.authRequired");
        assert!(events.contains(&"network.beforeRequestSent"));
    }

    #[test]
    fn cdp_module_is_prefix_matched() {
        assert!(is_module(CDP_MODULE));
        assert_eq!(module_of("goog:cdp.Network.requestWillBeSent"), CDP_MODULE);
        assert_eq!(module_of("browsingContext.load"), "browsingContext");
        assert!(is_subscribable("goog:cdp.Page.frameNavigated"));
        assert!(is_subscribable("log.entryAdded"));
        assert!(!is_subscribable("log.bogus"));
    }

    #[test]
    fn outgoing_event_shape() {
        let msg = OutgoingMessage::event(
            "browsingContext.load",
            serde_json::json!({"context": "ctx"}),
            Some("chan".into()),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["method"], "browsingContext.load");
        assert_eq!(value["channel"], "chan");
    }
}
