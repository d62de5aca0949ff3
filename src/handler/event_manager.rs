//! Fan-out of produced events to outbound channels. Items enter the queue
//! in the order their triggering CDP event was observed and leave in that
//! same order, even when a later payload finishes serializing first: the
//! drain task awaits each head before touching the next. Command responses
//! travel through the same queue, which is what preserves request order for
//! responses.

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::bidi::OutgoingMessage;
use crate::error::Result;
use crate::handler::context::BrowsingContextStorage;
use crate::handler::subscription::{ChannelTag, SubscriptionManager};

enum Queued {
    Event {
        name: String,
        context: Option<String>,
        /// When set, the event is delivered to this channel only (channel
        /// proxies must not leak to other subscribers).
        only_channel: Option<ChannelTag>,
        params: BoxFuture<'static, Result<serde_json::Value>>,
    },
    Message(BoxFuture<'static, Option<OutgoingMessage>>),
}

/// Reserved position in the outbound queue for one command response.
#[derive(Debug)]
pub struct ResponseSlot {
    tx: futures::channel::oneshot::Sender<OutgoingMessage>,
}

impl ResponseSlot {
    pub fn fulfill(self, msg: OutgoingMessage) {
        let _ = self.tx.send(msg);
    }
}

#[derive(Clone)]
pub struct EventManager {
    tx: mpsc::UnboundedSender<Queued>,
}

impl EventManager {
    /// Spawn the drain task and hand out the shared emitter handle.
    pub fn spawn(
        subscriptions: SubscriptionManager,
        contexts: BrowsingContextStorage,
        sink: mpsc::UnboundedSender<OutgoingMessage>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain(rx, subscriptions, contexts, sink));
        Self { tx }
    }

    /// An emitter wired to nothing; for state-only tests that never read
    /// events.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }

    /// Queue an event whose payload is already known.
    pub fn emit(&self, name: impl Into<String>, context: Option<String>, params: serde_json::Value) {
        let _ = self.tx.send(Queued::Event {
            name: name.into(),
            context,
            only_channel: None,
            params: futures::future::ready(Ok(params)).boxed(),
        });
    }

    /// Queue an event whose payload is still being built (value
    /// serialization and similar). Its position in the output is fixed now.
    pub fn emit_lazy(
        &self,
        name: impl Into<String>,
        context: Option<String>,
        params: impl std::future::Future<Output = Result<serde_json::Value>> + Send + 'static,
    ) {
        let _ = self.tx.send(Queued::Event {
            name: name.into(),
            context,
            only_channel: None,
            params: params.boxed(),
        });
    }

    /// Queue an event that may only go to one specific channel.
    pub fn emit_to_channel(
        &self,
        channel: ChannelTag,
        name: impl Into<String>,
        context: Option<String>,
        params: serde_json::Value,
    ) {
        let _ = self.tx.send(Queued::Event {
            name: name.into(),
            context,
            only_channel: Some(channel),
            params: futures::future::ready(Ok(params)).boxed(),
        });
    }

    /// Reserve the next output position for a command response. The
    /// response is written out once `fulfill` is called *and* every earlier
    /// queue entry has drained.
    pub fn reserve_response(&self) -> ResponseSlot {
        let (tx, rx) = futures::channel::oneshot::channel();
        let _ = self
            .tx
            .send(Queued::Message(rx.map(|result| result.ok()).boxed()));
        ResponseSlot { tx }
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager").finish()
    }
}

async fn drain(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    subscriptions: SubscriptionManager,
    contexts: BrowsingContextStorage,
    sink: mpsc::UnboundedSender<OutgoingMessage>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Queued::Message(future) => {
                if let Some(msg) = future.await {
                    let _ = sink.send(msg);
                }
            }
            Queued::Event {
                name,
                context,
                only_channel,
                params,
            } => {
                // subscriptions are keyed on top-level contexts
                let top_level = context
                    .as_deref()
                    .map(|id| contexts.top_level_id(id).unwrap_or_else(|_| id.to_string()));
                let subscribed = subscriptions.channels_subscribed_to(&name, top_level.as_deref());
                let channels: Vec<ChannelTag> = match only_channel {
                    Some(channel) if subscribed.contains(&channel) => vec![channel],
                    Some(_) => Vec::new(),
                    None => subscribed,
                };
                if channels.is_empty() {
                    continue;
                }
                match params.await {
                    Ok(params) => {
                        for channel in channels {
                            let _ = sink.send(OutgoingMessage::event(
                                name.clone(),
                                params.clone(),
                                channel,
                            ));
                        }
                    }
                    Err(err) => {
                        tracing::debug!("dropping {name} event, payload failed: {err}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn setup() -> (
        EventManager,
        SubscriptionManager,
        mpsc::UnboundedReceiver<OutgoingMessage>,
    ) {
        let subscriptions = SubscriptionManager::new();
        let contexts = BrowsingContextStorage::new();
        let (sink, out) = mpsc::unbounded_channel();
        let manager = EventManager::spawn(subscriptions.clone(), contexts, sink);
        (manager, subscriptions, out)
    }

    #[tokio::test]
    async fn slow_payload_does_not_reorder() {
        let (manager, subscriptions, mut out) = setup();
        subscriptions.subscribe("log.entryAdded", None, &None).unwrap();

        manager.emit_lazy("log.entryAdded", None, async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok(serde_json::json!({"seq": 1}))
        });
        manager.emit("log.entryAdded", None, serde_json::json!({"seq": 2}));

        for expected in 1..=2 {
            match out.recv().await.unwrap() {
                OutgoingMessage::Event { params, .. } => {
                    assert_eq!(params["seq"], expected);
                }
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn responses_keep_request_order() {
        let (manager, _subscriptions, mut out) = setup();
        let first = manager.reserve_response();
        let second = manager.reserve_response();

        // the later command finishes first
        second.fulfill(OutgoingMessage::result(2, serde_json::json!({}), None));
        first.fulfill(OutgoingMessage::result(1, serde_json::json!({}), None));

        for expected in 1..=2u64 {
            match out.recv().await.unwrap() {
                OutgoingMessage::Result { id, .. } => assert_eq!(id, expected),
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn unsubscribed_events_are_dropped() {
        let (manager, subscriptions, mut out) = setup();
        manager.emit("log.entryAdded", None, serde_json::json!({"seq": 1}));
        subscriptions
            .subscribe("browsingContext.load", None, &Some("x".into()))
            .unwrap();
        manager.emit(
            "browsingContext.load",
            None,
            serde_json::json!({"context": "c"}),
        );
        match out.recv().await.unwrap() {
            OutgoingMessage::Event { method, channel, .. } => {
                assert_eq!(method, "browsingContext.load");
                assert_eq!(channel.as_deref(), Some("x"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn channel_scoped_events_do_not_leak() {
        let (manager, subscriptions, mut out) = setup();
        subscriptions
            .subscribe("script.message", None, &Some("a".into()))
            .unwrap();
        subscriptions
            .subscribe("script.message", None, &Some("b".into()))
            .unwrap();

        manager.emit_to_channel(
            Some("a".into()),
            "script.message",
            None,
            serde_json::json!({"channel": "a"}),
        );
        // marker to prove nothing else was queued for channel b
        manager.emit("script.message", None, serde_json::json!({"broadcast": true}));

        match out.recv().await.unwrap() {
            OutgoingMessage::Event { channel, .. } => assert_eq!(channel.as_deref(), Some("a")),
            other => panic!("unexpected message: {other:?}"),
        }
        match out.recv().await.unwrap() {
            OutgoingMessage::Event { channel, params, .. } => {
                assert_eq!(channel.as_deref(), Some("a"));
                assert_eq!(params["broadcast"], true);
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }
}
