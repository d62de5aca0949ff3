//! Per-context navigation state: lifecycle latches, navigation identity and
//! the translation of CDP lifecycle events into BiDi navigation events.
//!
//! Every context starts out in the synthetic "about:blank" navigation, which
//! never produces events. A client `navigate` or a CDP
//! `Page.frameRequestedNavigation` supersedes the current navigation; a
//! superseded in-flight navigation is rejected with a "canceled" reason so
//! every awaiter fails deterministically.

use std::future::Future;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::bidi;
use crate::bidi::browsing_context::NavigationInfo;
use crate::cdp::LoaderId;
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::handler::event_manager::EventManager;

#[derive(Debug)]
struct Navigation {
    id: String,
    url: String,
    /// The synthetic navigation a context is born with.
    initial: bool,
    /// A client-initiated navigation triggers a `frameRequestedNavigation`
    /// for itself; that echo must not supersede it.
    expects_frame_requested: bool,
    /// Previous navigation in the chain, for diagnostics.
    prev_id: Option<String>,
    finished: Deferred<()>,
}

impl Navigation {
    fn synthetic(url: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url,
            initial: true,
            expects_frame_requested: false,
            prev_id: None,
            finished: Deferred::new(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    context_id: String,
    events: EventManager,
    url: String,
    loader_id: Option<LoaderId>,
    dom_content_loaded: Deferred<()>,
    load: Deferred<()>,
    navigated_within_document: Deferred<String>,
    current: Navigation,
}

/// Identity of a navigation handed back to the `navigate` command.
#[derive(Debug, Clone)]
pub struct StartedNavigation {
    pub id: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct NavigationTracker {
    inner: Arc<Mutex<Inner>>,
}

impl NavigationTracker {
    pub fn new(context_id: impl Into<String>, url: impl Into<String>, events: EventManager) -> Self {
        let url = url.into();
        Self {
            inner: Arc::new(Mutex::new(Inner {
                context_id: context_id.into(),
                events,
                url: url.clone(),
                loader_id: None,
                dom_content_loaded: Deferred::new(),
                load: Deferred::new(),
                navigated_within_document: Deferred::new(),
                current: Navigation::synthetic(url),
            })),
        }
    }

    pub fn url(&self) -> String {
        self.lock().url.clone()
    }

    pub fn set_url(&self, url: impl Into<String>) {
        self.lock().url = url.into();
    }

    /// The current navigation id, hidden while still in the synthetic
    /// initial navigation.
    pub fn current_navigation_id(&self) -> Option<String> {
        let inner = self.lock();
        if inner.current.initial {
            None
        } else {
            Some(inner.current.id.clone())
        }
    }

    /// Begin a client-requested navigation: supersede whatever is in
    /// flight and emit `navigationStarted`.
    pub fn start_client_navigation(&self, url: impl Into<String>) -> StartedNavigation {
        let mut inner = self.lock();
        let url = url.into();
        inner.supersede(url.clone(), true);
        inner.emit_navigation_event("browsingContext.navigationStarted");
        StartedNavigation {
            id: inner.current.id.clone(),
            url,
        }
    }

    /// CDP scheduled a navigation. The echo of our own `Page.navigate` is
    /// absorbed; anything else supersedes the current navigation and, when
    /// not the synthetic initial one, announces itself.
    pub fn on_frame_requested_navigation(&self, url: &str) {
        let mut inner = self.lock();
        if inner.current.expects_frame_requested && inner.current.url == url {
            inner.current.expects_frame_requested = false;
            return;
        }
        if inner.current.initial && inner.current.url == url {
            // the browser announcing the initial about:blank load
            return;
        }
        inner.supersede(url.to_string(), false);
        inner.emit_navigation_event("browsingContext.navigationStarted");
    }

    /// `Page.lifecycleEvent` for the owning frame.
    pub fn on_lifecycle_event(&self, name: &str, loader_id: &LoaderId) {
        let mut inner = self.lock();
        // attached late: adopt the first loader id we observe
        if inner.loader_id.is_none() {
            inner.loader_id = Some(loader_id.clone());
        }
        match name {
            "init" => {
                inner.loader_id = Some(loader_id.clone());
                // a new document: settled latches of the previous one are
                // replaced; pending ones belong to the navigation that
                // caused this init and stay armed
                inner.refresh_settled_latches();
            }
            "commit" => {
                inner.loader_id = Some(loader_id.clone());
            }
            "DOMContentLoaded" => {
                if inner.loader_id.as_ref() != Some(loader_id) {
                    return;
                }
                inner.dom_content_loaded.resolve(());
                if !inner.current.initial {
                    inner.emit_navigation_event("browsingContext.domContentLoaded");
                }
            }
            "load" => {
                if inner.loader_id.as_ref() != Some(loader_id) {
                    return;
                }
                inner.load.resolve(());
                if !inner.current.initial {
                    inner.emit_navigation_event("browsingContext.load");
                }
                inner.current.finished.resolve(());
            }
            _ => {}
        }
    }

    /// `Page.navigatedWithinDocument`: fragment and history-API navigations
    /// resolve the same-document latch and update the URL.
    pub fn on_navigated_within_document(&self, url: &str, navigation_type: Option<&str>) {
        let mut inner = self.lock();
        inner.url = url.to_string();
        inner.current.url = url.to_string();
        match navigation_type {
            Some("historyApi") => {
                let params = serde_json::json!({
                    "context": inner.context_id,
                    "timestamp": bidi::timestamp(),
                    "url": url,
                });
                inner.events.emit(
                    "browsingContext.historyUpdated",
                    Some(inner.context_id.clone()),
                    params,
                );
            }
            _ => {
                inner.emit_navigation_event("browsingContext.fragmentNavigated");
            }
        }
        inner.navigated_within_document.resolve(url.to_string());
        // fresh latch for the next same-document navigation
        inner.reset_within_document_latch();
    }

    /// `Page.frameNavigated` for the owning frame: replace the URL,
    /// fragment included.
    pub fn on_frame_navigated(&self, url: &str) {
        let mut inner = self.lock();
        inner.url = url.to_string();
    }

    /// The CDP navigate call itself failed; the navigation is terminal.
    pub fn fail_navigation(&self, navigation: &StartedNavigation, message: &str) {
        let mut inner = self.lock();
        let params = serde_json::to_value(NavigationInfo {
            context: inner.context_id.clone(),
            navigation: Some(navigation.id.clone()),
            timestamp: bidi::timestamp(),
            url: navigation.url.clone(),
        })
        .unwrap_or_default();
        inner.events.emit(
            "browsingContext.navigationFailed",
            Some(inner.context_id.clone()),
            params,
        );
        if inner.current.id == navigation.id {
            inner
                .current
                .finished
                .reject(Error::unknown(format!("navigation failed: {message}")));
        }
    }

    /// Context going away: every pending latch fails.
    pub fn dispose(&self) {
        let mut inner = self.lock();
        let reason = Error::navigation_canceled();
        inner.dom_content_loaded.reject(reason.clone());
        inner.load.reject(reason.clone());
        inner
            .navigated_within_document
            .reject(reason.clone());
        inner.current.finished.reject(reason);
    }

    /// Rejected with "canceled" when the navigation is superseded before
    /// finishing.
    pub fn wait_finished(&self, navigation: &StartedNavigation) -> impl Future<Output = Result<()>> {
        use futures::future::{self, Either};
        let inner = self.lock();
        if inner.current.id != navigation.id {
            Either::Left(future::ready(Err(Error::navigation_canceled())))
        } else {
            Either::Right(inner.current.finished.wait())
        }
    }

    pub fn wait_dom_content_loaded(&self) -> impl Future<Output = Result<()>> {
        self.lock().dom_content_loaded.wait()
    }

    pub fn wait_load(&self) -> impl Future<Output = Result<()>> {
        self.lock().load.wait()
    }

    pub fn wait_within_document(&self) -> impl Future<Output = Result<String>> {
        self.lock().navigated_within_document.wait()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("navigation tracker poisoned")
    }
}

impl Inner {
    /// Replace the current navigation, rejecting the superseded one and
    /// announcing the abort when it was still in flight. Awaiters of the
    /// in-flight navigation's latches observe the rejection; the fresh
    /// latches belong to the new navigation.
    fn supersede(&mut self, url: String, by_client: bool) {
        let prev_id = self.current.id.clone();
        if !self.current.initial && self.current.finished.is_pending() {
            self.emit_navigation_event("browsingContext.navigationAborted");
            self.current.finished.reject(Error::navigation_canceled());
        }
        self.rotate_latches();
        self.current = Navigation {
            id: Uuid::new_v4().to_string(),
            url: url.clone(),
            initial: false,
            expects_frame_requested: by_client,
            prev_id: Some(prev_id),
            finished: Deferred::new(),
        };
        tracing::debug!(
            context = %self.context_id,
            navigation = %self.current.id,
            prev = ?self.current.prev_id,
            %url,
            "navigation started"
        );
    }

    /// Reject whatever is still pending and arm fresh latches; used when a
    /// navigation supersedes the in-flight one.
    fn rotate_latches(&mut self) {
        let reason = Error::navigation_canceled();
        self.dom_content_loaded.reject(reason.clone());
        self.load.reject(reason.clone());
        self.navigated_within_document.reject(reason);
        self.dom_content_loaded = Deferred::new();
        self.load = Deferred::new();
        self.navigated_within_document = Deferred::new();
    }

    /// Replace only settled latches; pending ones stay armed for the
    /// navigation whose document change triggered this.
    fn refresh_settled_latches(&mut self) {
        if !self.dom_content_loaded.is_pending() {
            self.dom_content_loaded = Deferred::new();
        }
        if !self.load.is_pending() {
            self.load = Deferred::new();
        }
    }

    fn reset_within_document_latch(&mut self) {
        if !self.navigated_within_document.is_pending() {
            self.navigated_within_document = Deferred::new();
        }
    }

    fn emit_navigation_event(&mut self, name: &'static str) {
        let params = serde_json::to_value(NavigationInfo {
            context: self.context_id.clone(),
            navigation: Some(self.current.id.clone()),
            timestamp: bidi::timestamp(),
            url: self.current.url.clone(),
        })
        .unwrap_or_default();
        self.events.emit(name, Some(self.context_id.clone()), params);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::test_event_manager;

    fn tracker() -> (NavigationTracker, tokio::sync::mpsc::UnboundedReceiver<crate::bidi::OutgoingMessage>)
    {
        let (events, subscriptions, out) = test_event_manager();
        subscriptions.subscribe("browsingContext", None, &None).unwrap();
        (
            NavigationTracker::new("ctx", "about:blank", events),
            out,
        )
    }

    async fn next_event(
        out: &mut tokio::sync::mpsc::UnboundedReceiver<crate::bidi::OutgoingMessage>,
    ) -> (String, serde_json::Value) {
        match out.recv().await.unwrap() {
            crate::bidi::OutgoingMessage::Event { method, params, .. } => (method, params),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn initial_navigation_is_silent() {
        let (tracker, mut out) = tracker();
        assert_eq!(tracker.current_navigation_id(), None);
        let loader = LoaderId::new("l1");
        tracker.on_lifecycle_event("init", &loader);
        tracker.on_lifecycle_event("DOMContentLoaded", &loader);
        tracker.on_lifecycle_event("load", &loader);
        // only navigations after the synthetic one produce events
        tracker.start_client_navigation("https://example.com/");
        let (method, params) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.navigationStarted");
        assert_eq!(params["url"], "https://example.com/");
    }

    #[tokio::test]
    async fn lifecycle_events_with_stale_loader_are_ignored() {
        // after init(loaderId=L), a DOMContentLoaded for loader != L must
        // not resolve the latch
        let (tracker, _out) = tracker();
        tracker.start_client_navigation("https://example.com/");
        let current = LoaderId::new("l-current");
        let stale = LoaderId::new("l-stale");
        tracker.on_lifecycle_event("init", &current);
        let wait = tracker.wait_dom_content_loaded();
        tracker.on_lifecycle_event("DOMContentLoaded", &stale);
        // still pending: resolving now must come from the current loader
        tracker.on_lifecycle_event("DOMContentLoaded", &current);
        wait.await.unwrap();
    }

    #[tokio::test]
    async fn superseding_rejects_and_announces() {
        let (tracker, mut out) = tracker();
        let first = tracker.start_client_navigation("https://a.example/");
        let finished = tracker.wait_finished(&first);
        let (method, _) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.navigationStarted");

        tracker.on_frame_requested_navigation("https://b.example/");
        assert!(finished.await.is_err());

        let (method, params) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.navigationAborted");
        assert_eq!(params["navigation"], first.id);
        let (method, params) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.navigationStarted");
        assert_ne!(params["navigation"], first.id);
    }

    #[tokio::test]
    async fn own_frame_requested_echo_is_absorbed() {
        let (tracker, mut out) = tracker();
        let started = tracker.start_client_navigation("https://a.example/");
        let (_, _) = next_event(&mut out).await;
        tracker.on_frame_requested_navigation("https://a.example/");
        // still the same navigation
        assert_eq!(tracker.current_navigation_id().unwrap(), started.id);
    }

    #[tokio::test]
    async fn load_resolves_navigation() {
        let (tracker, mut out) = tracker();
        let started = tracker.start_client_navigation("https://a.example/");
        let finished = tracker.wait_finished(&started);
        let loader = LoaderId::new("l1");
        tracker.on_lifecycle_event("init", &loader);
        tracker.on_lifecycle_event("DOMContentLoaded", &loader);
        tracker.on_lifecycle_event("load", &loader);
        finished.await.unwrap();

        let (method, _) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.navigationStarted");
        let (method, params) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.domContentLoaded");
        assert_eq!(params["navigation"], started.id);
        let (method, params) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.load");
        assert_eq!(params["navigation"], started.id);
    }

    #[tokio::test]
    async fn fragment_and_history_navigations() {
        let (tracker, mut out) = tracker();
        let wait = tracker.wait_within_document();
        tracker.on_navigated_within_document("https://a.example/#frag", Some("fragment"));
        assert_eq!(wait.await.unwrap(), "https://a.example/#frag");
        let (method, _) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.fragmentNavigated");

        tracker.on_navigated_within_document("https://a.example/pushed", Some("historyApi"));
        let (method, params) = next_event(&mut out).await;
        assert_eq!(method, "browsingContext.historyUpdated");
        assert_eq!(params["url"], "https://a.example/pushed");
        assert_eq!(tracker.url(), "https://a.example/pushed");
    }
}
