//! A WebDriver BiDi to [Chrome DevTools Protocol](https://chromedevtools.github.io/devtools-protocol/)
//! mapper core.
//!
//! The crate terminates the BiDi command/event protocol and drives a
//! browser through CDP: inbound commands are translated into one or more
//! CDP commands, and the resulting CDP events and responses are collated
//! back into BiDi responses and subscribed events. The long-lived
//! [`Mapper`] owns the world model of browser state (browsing contexts,
//! script realms, network requests, input sources, subscriptions,
//! interceptions) and reconciles the two out-of-order streams into a
//! consistent view.
//!
//! Transports stay outside: the embedder implements [`cdp::CdpConnection`]
//! over its wire of choice, feeds CDP events into
//! [`Mapper::handle_cdp_event`], client commands into
//! [`Mapper::handle_command`], and drains outbound messages from the
//! channel handed to [`Mapper::new`].
//!
//! # Example
//! ```no_run
//! use bidioxide::{Mapper, MapperConfig};
//!
//! # async fn run(conn: bidioxide::cdp::SharedConnection) -> bidioxide::Result<()> {
//! let (sink, mut outbound) = tokio::sync::mpsc::unbounded_channel();
//! let mapper = Mapper::new(conn, sink, MapperConfig::default());
//! mapper.start().await?;
//!
//! tokio::spawn(async move {
//!     while let Some(message) = outbound.recv().await {
//!         // write to the client socket
//!         let _ = serde_json::to_string(&message);
//!     }
//! });
//! # Ok(())
//! # }
//! ```

#![warn(missing_debug_implementations, rust_2018_idioms)]

pub mod bidi;
pub mod cdp;
pub mod deferred;
pub mod error;
pub mod handler;

pub use crate::bidi::{CommandEnvelope, OutgoingMessage};
pub use crate::cdp::{CdpEventMessage, CdpSession, SharedConnection};
pub use crate::error::{CdpError, Error, Result};
pub use crate::handler::{Mapper, MapperConfig, Platform, UserPromptPolicy};
