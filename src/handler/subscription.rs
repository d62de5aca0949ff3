//! Per-channel, per-context routing table for event delivery. Subscriptions
//! are keyed on top-level contexts (callers resolve nesting before they get
//! here) and carry a strictly increasing priority so delivery order follows
//! subscription order.

use std::sync::{Arc, Mutex};

use hashbrown::HashMap;

use crate::bidi;
use crate::error::{Error, Result};

/// The client-supplied channel tag; `None` is the untagged channel.
pub type ChannelTag = Option<String>;

#[derive(Debug, Clone, Default)]
pub struct SubscriptionManager {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    priority: u64,
    /// channel → context (`None` = global) → event name → priority.
    /// Module names expand to atomic events on insert; only the `goog:cdp`
    /// sentinel stays unexpanded and is matched by prefix on lookup.
    subscriptions: HashMap<ChannelTag, HashMap<Option<String>, HashMap<String, u64>>>,
}

impl Inner {
    fn insert(&mut self, event: &str, context: Option<&str>, channel: &ChannelTag) {
        let events = self
            .subscriptions
            .entry(channel.clone())
            .or_default()
            .entry(context.map(str::to_string))
            .or_default();
        // re-subscribing keeps the original priority
        if !events.contains_key(event) {
            self.priority += 1;
            events.insert(event.to_string(), self.priority);
        }
    }

    fn contains(&self, event: &str, context: Option<&str>, channel: &ChannelTag) -> bool {
        self.subscriptions
            .get(channel)
            .and_then(|contexts| contexts.get(&context.map(str::to_string)))
            .map(|events| events.contains_key(event))
            .unwrap_or(false)
    }

    fn remove(&mut self, event: &str, context: Option<&str>, channel: &ChannelTag) {
        if let Some(contexts) = self.subscriptions.get_mut(channel) {
            let key = context.map(str::to_string);
            if let Some(events) = contexts.get_mut(&key) {
                events.remove(event);
                if events.is_empty() {
                    contexts.remove(&key);
                }
            }
            if contexts.is_empty() {
                self.subscriptions.remove(channel);
            }
        }
    }

    fn priority_of(&self, event: &str, context: Option<&str>, channel: &ChannelTag) -> Option<u64> {
        self.subscriptions
            .get(channel)?
            .get(&context.map(str::to_string))?
            .get(event)
            .copied()
    }
}

/// The atomic names one subscribe/unsubscribe target expands to. Non-module
/// names pass through; `goog:cdp` stays a sentinel.
fn expansion(name: &str) -> Result<Vec<&str>> {
    if !bidi::is_subscribable(name) {
        return Err(Error::invalid_argument(format!(
            "unknown event or module: {name}"
        )));
    }
    if name == bidi::CDP_MODULE {
        return Ok(vec![bidi::CDP_MODULE]);
    }
    match bidi::expand_module(name) {
        Some(events) => Ok(events.to_vec()),
        None => Ok(vec![name]),
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a channel to an event or module on a top-level context
    /// (`None` = globally). Subscribing an already-subscribed triple is a
    /// no-op that preserves the original priority.
    pub fn subscribe(
        &self,
        event_or_module: &str,
        context: Option<&str>,
        channel: &ChannelTag,
    ) -> Result<()> {
        let names = expansion(event_or_module)?;
        let mut inner = self.inner.lock().expect("subscription map poisoned");
        for name in names {
            inner.insert(name, context, channel);
        }
        Ok(())
    }

    /// Remove one subscription; `invalid argument` when the triple (after
    /// module expansion) is not fully subscribed.
    pub fn unsubscribe(
        &self,
        event_or_module: &str,
        context: Option<&str>,
        channel: &ChannelTag,
    ) -> Result<()> {
        self.unsubscribe_all(
            std::slice::from_ref(&event_or_module),
            &[context],
            channel,
        )
    }

    /// Atomic unsubscribe: every (event, context) pair is validated before
    /// anything is removed; on any miss nothing changes.
    pub fn unsubscribe_all<E: AsRef<str>>(
        &self,
        events: &[E],
        contexts: &[Option<&str>],
        channel: &ChannelTag,
    ) -> Result<()> {
        let mut removals: Vec<(&str, Option<&str>)> = Vec::new();
        for event in events {
            for context in contexts {
                for name in expansion(event.as_ref())? {
                    removals.push((name, *context));
                }
            }
        }

        let mut inner = self.inner.lock().expect("subscription map poisoned");
        for (name, context) in &removals {
            if !inner.contains(name, *context, channel) {
                return Err(Error::invalid_argument(format!(
                    "no subscription for {name}"
                )));
            }
        }
        for (name, context) in removals {
            inner.remove(name, context, channel);
        }
        Ok(())
    }

    /// The channels subscribed to `event` on `top_level_context`, sorted by
    /// the minimum priority across the global and context entries and across
    /// the atomic name and its module prefix.
    pub fn channels_subscribed_to(
        &self,
        event: &str,
        top_level_context: Option<&str>,
    ) -> Vec<ChannelTag> {
        let module = bidi::module_of(event);
        let inner = self.inner.lock().expect("subscription map poisoned");

        let mut ranked: Vec<(u64, ChannelTag)> = Vec::new();
        for channel in inner.subscriptions.keys() {
            let mut min: Option<u64> = None;
            for context in [None, top_level_context] {
                for name in [event, module] {
                    if let Some(priority) = inner.priority_of(name, context, channel) {
                        min = Some(min.map_or(priority, |m: u64| m.min(priority)));
                    }
                }
            }
            if let Some(min) = min {
                ranked.push((min, channel.clone()));
            }
        }
        ranked.sort_by_key(|(priority, _)| *priority);
        ranked.into_iter().map(|(_, channel)| channel).collect()
    }

    /// Whether any channel is subscribed to the event (or anything under
    /// the module) on the given top-level context or globally.
    pub fn is_subscribed_to(&self, event_or_module: &str, top_level_context: Option<&str>) -> bool {
        let names = match expansion(event_or_module) {
            Ok(names) => names,
            Err(_) => return false,
        };
        let module = bidi::module_of(event_or_module);
        let inner = self.inner.lock().expect("subscription map poisoned");
        inner.subscriptions.keys().any(|channel| {
            [None, top_level_context].into_iter().any(|context| {
                names
                    .iter()
                    .any(|name| inner.priority_of(name, context, channel).is_some())
                    || inner.priority_of(module, context, channel).is_some()
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chan(name: &str) -> ChannelTag {
        Some(name.to_string())
    }

    #[test]
    fn subscription_order_is_priority_order() {
        let manager = SubscriptionManager::new();
        manager
            .subscribe("browsingContext.load", None, &chan("x"))
            .unwrap();
        manager
            .subscribe("browsingContext.contextCreated", None, &chan("x"))
            .unwrap();
        manager
            .subscribe("browsingContext.load", None, &chan("y"))
            .unwrap();
        manager.subscribe("network", None, &chan("x")).unwrap();

        assert_eq!(
            manager.channels_subscribed_to("browsingContext.load", Some("top")),
            vec![chan("x"), chan("y")]
        );
        assert_eq!(
            manager.channels_subscribed_to("network.beforeRequestSent", Some("top")),
            vec![chan("x")]
        );
    }

    #[test]
    fn resubscribing_preserves_priority() {
        let manager = SubscriptionManager::new();
        manager.subscribe("log.entryAdded", None, &chan("a")).unwrap();
        manager.subscribe("log.entryAdded", None, &chan("b")).unwrap();
        // `a` subscribes again: priority stays ahead of `b`
        manager.subscribe("log.entryAdded", None, &chan("a")).unwrap();
        assert_eq!(
            manager.channels_subscribed_to("log.entryAdded", None),
            vec![chan("a"), chan("b")]
        );
    }

    #[test]
    fn module_subscription_equals_atomic_enumeration() {
        let expanded = SubscriptionManager::new();
        expanded.subscribe("network", None, &chan("x")).unwrap();
        let manual = SubscriptionManager::new();
        for event in bidi::NETWORK_EVENTS {
            manual.subscribe(event, None, &chan("x")).unwrap();
        }
        for event in bidi::NETWORK_EVENTS {
            assert_eq!(
                expanded.channels_subscribed_to(event, Some("top")),
                manual.channels_subscribed_to(event, Some("top")),
                "{event}"
            );
        }
    }

    #[test]
    fn context_subscription_only_covers_that_context() {
        let manager = SubscriptionManager::new();
        manager
            .subscribe("browsingContext.load", Some("top-a"), &chan("x"))
            .unwrap();
        assert_eq!(
            manager.channels_subscribed_to("browsingContext.load", Some("top-a")),
            vec![chan("x")]
        );
        assert!(manager
            .channels_subscribed_to("browsingContext.load", Some("top-b"))
            .is_empty());
        assert!(manager.is_subscribed_to("browsingContext.load", Some("top-a")));
        assert!(!manager.is_subscribed_to("browsingContext.load", Some("top-b")));
    }

    #[test]
    fn global_entry_ranks_against_context_entry() {
        let manager = SubscriptionManager::new();
        manager
            .subscribe("browsingContext.load", Some("top"), &chan("ctx"))
            .unwrap();
        manager
            .subscribe("browsingContext.load", None, &chan("global"))
            .unwrap();
        assert_eq!(
            manager.channels_subscribed_to("browsingContext.load", Some("top")),
            vec![chan("ctx"), chan("global")]
        );
    }

    #[test]
    fn cdp_module_matches_by_prefix() {
        let manager = SubscriptionManager::new();
        manager.subscribe(bidi::CDP_MODULE, None, &chan("x")).unwrap();
        assert_eq!(
            manager.channels_subscribed_to("goog:cdp.Network.requestWillBeSent", None),
            vec![chan("x")]
        );
        assert!(manager.is_subscribed_to(bidi::CDP_MODULE, None));
    }

    #[test]
    fn unsubscribe_all_is_atomic() {
        let manager = SubscriptionManager::new();
        manager.subscribe("log.entryAdded", None, &chan("x")).unwrap();
        let err = manager
            .unsubscribe_all(
                &["log.entryAdded", "network.beforeRequestSent"],
                &[None],
                &chan("x"),
            )
            .unwrap_err();
        assert_eq!(err.code(), "invalid argument");
        // nothing was removed
        assert!(manager.is_subscribed_to("log.entryAdded", None));

        manager
            .subscribe("network.beforeRequestSent", None, &chan("x"))
            .unwrap();
        manager
            .unsubscribe_all(
                &["log.entryAdded", "network.beforeRequestSent"],
                &[None],
                &chan("x"),
            )
            .unwrap();
        assert!(!manager.is_subscribed_to("log.entryAdded", None));
        assert!(!manager.is_subscribed_to("network.beforeRequestSent", None));
    }

    #[test]
    fn unsubscribe_unknown_event_is_invalid() {
        let manager = SubscriptionManager::new();
        let err = manager
            .unsubscribe("browsingContext.load", None, &chan("x"))
            .unwrap_err();
        assert_eq!(err.code(), "invalid argument");
        assert!(manager
            .subscribe("definitely.not.an.event", None, &chan("x"))
            .is_err());
    }
}
