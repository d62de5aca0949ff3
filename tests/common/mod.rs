//! Shared harness for the end-to-end tests: a scripted CDP connection plus
//! helpers to stand up a mapper with an attached page target.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use bidioxide::bidi::{CommandEnvelope, OutgoingMessage};
use bidioxide::cdp::{CdpConnection, CdpEventMessage, SessionId};
use bidioxide::error::CdpError;
use bidioxide::{Mapper, MapperConfig};

/// Records every command and answers from a per-method script, or with an
/// empty object.
#[derive(Default)]
pub struct StubConnection {
    sent: Mutex<Vec<(String, serde_json::Value)>>,
    responses: Mutex<std::collections::HashMap<String, serde_json::Value>>,
}

impl StubConnection {
    pub fn respond(&self, method: &str, value: serde_json::Value) {
        self.responses
            .lock()
            .unwrap()
            .insert(method.to_string(), value);
    }

    pub fn sent(&self) -> Vec<(String, serde_json::Value)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_matching(&self, method: &str) -> Vec<serde_json::Value> {
        self.sent()
            .into_iter()
            .filter(|(m, _)| m == method)
            .map(|(_, params)| params)
            .collect()
    }
}

#[async_trait]
impl CdpConnection for StubConnection {
    async fn send(
        &self,
        _session_id: Option<&SessionId>,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CdpError> {
        self.sent
            .lock()
            .unwrap()
            .push((method.to_string(), params));
        Ok(self
            .responses
            .lock()
            .unwrap()
            .get(method)
            .cloned()
            .unwrap_or_else(|| serde_json::json!({})))
    }
}

pub struct Harness {
    pub mapper: Mapper,
    pub conn: Arc<StubConnection>,
    pub out: mpsc::UnboundedReceiver<OutgoingMessage>,
    next_id: u64,
}

impl Harness {
    pub fn new() -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let conn = Arc::new(StubConnection::default());
        let (sink, out) = mpsc::unbounded_channel();
        let mapper = Mapper::new(conn.clone(), sink, MapperConfig::default());
        Self {
            mapper,
            conn,
            out,
            next_id: 0,
        }
    }

    /// Inject one CDP event.
    pub fn cdp_event(&self, session: Option<&str>, method: &str, params: serde_json::Value) {
        self.mapper.handle_cdp_event(CdpEventMessage::new(
            session.map(SessionId::new),
            method,
            params,
        ));
    }

    /// Simulate auto-attach surfacing a page target; the context exists
    /// once this returns.
    pub fn attach_page(&self, context_id: &str, session_id: &str, url: &str) {
        self.cdp_event(
            None,
            "Target.attachedToTarget",
            serde_json::json!({
                "sessionId": session_id,
                "waitingForDebugger": true,
                "targetInfo": {
                    "targetId": context_id,
                    "type": "page",
                    "title": "",
                    "url": url,
                    "attached": true,
                },
            }),
        );
        assert!(self.mapper.contexts().has(context_id));
    }

    /// Fire one command; the response arrives on the outbound channel.
    pub fn command(
        &mut self,
        method: &str,
        params: serde_json::Value,
        channel: Option<&str>,
    ) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.mapper.handle_command(CommandEnvelope {
            id,
            method: method.to_string(),
            channel: channel.map(str::to_string),
            params,
        });
        id
    }

    pub async fn next_message(&mut self) -> OutgoingMessage {
        tokio::time::timeout(std::time::Duration::from_secs(5), self.out.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbound channel closed")
    }

    /// The next outbound event, asserting on its method.
    pub async fn expect_event(&mut self, method: &str) -> serde_json::Value {
        match self.next_message().await {
            OutgoingMessage::Event {
                method: got,
                params,
                ..
            } => {
                assert_eq!(got, method, "unexpected event order");
                params
            }
            other => panic!("expected {method} event, got {other:?}"),
        }
    }

    /// The next outbound message must be the successful response to `id`.
    pub async fn expect_result(&mut self, id: u64) -> serde_json::Value {
        match self.next_message().await {
            OutgoingMessage::Result {
                id: got, result, ..
            } => {
                assert_eq!(got, id, "unexpected response order");
                result
            }
            other => panic!("expected result for {id}, got {other:?}"),
        }
    }

    pub async fn expect_error(&mut self, id: u64) -> (String, String) {
        match self.next_message().await {
            OutgoingMessage::Error {
                id: got,
                error,
                message,
                ..
            } => {
                assert_eq!(got, Some(id));
                (error, message)
            }
            other => panic!("expected error for {id}, got {other:?}"),
        }
    }
}
