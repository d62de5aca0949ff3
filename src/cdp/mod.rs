//! The CDP side of the wire, as consumed by the core: a connection trait the
//! transport implements, a cheap session handle, and typed views over the
//! events the core reads. Commands travel as `(method, params)` pairs of
//! raw JSON; responses come back as raw JSON. The transport owns call-id
//! matching and the socket.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CdpError;

pub mod events;

pub use events::{CdpEvent, CdpEventMessage};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(inner: impl Into<String>) -> Self {
                Self(inner.into())
            }

            pub fn inner(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of one attached CDP session.
    SessionId
);
string_id!(
    /// Identifier of a CDP target.
    TargetId
);
string_id!(
    /// Identifier of a network request, shared between the `Network` and
    /// `Fetch` domains via `networkId`.
    RequestId
);
string_id!(
    /// Per-document loader identifier; an unchanged loader means a
    /// same-document navigation.
    LoaderId
);

/// The wire connection the core drives the browser through. One logical
/// connection multiplexes all sessions; `session_id = None` addresses the
/// browser-level session.
#[async_trait]
pub trait CdpConnection: Send + Sync + 'static {
    async fn send(
        &self,
        session_id: Option<&SessionId>,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CdpError>;
}

pub type SharedConnection = Arc<dyn CdpConnection>;

/// A lightweight handle addressing one session of the shared connection.
#[derive(Clone)]
pub struct CdpSession {
    conn: SharedConnection,
    session_id: Option<SessionId>,
}

impl CdpSession {
    pub fn browser(conn: SharedConnection) -> Self {
        Self {
            conn,
            session_id: None,
        }
    }

    pub fn attached(conn: SharedConnection, session_id: SessionId) -> Self {
        Self {
            conn,
            session_id: Some(session_id),
        }
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.session_id.as_ref()
    }

    /// A sibling handle for another session on the same connection.
    pub fn sibling(&self, session_id: SessionId) -> Self {
        Self {
            conn: self.conn.clone(),
            session_id: Some(session_id),
        }
    }

    /// The browser-level handle on the same connection.
    pub fn root(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            session_id: None,
        }
    }

    pub async fn send(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, CdpError> {
        self.conn.send(self.session_id.as_ref(), method, params).await
    }
}

impl fmt::Debug for CdpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CdpSession")
            .field("session_id", &self.session_id)
            .finish()
    }
}
