//! Network request storage: correlates the `Network.*` and `Fetch.*` event
//! streams into logical requests, owns the intercept table, and decides
//! which Fetch stages the owning targets need enabled.

use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use hashbrown::HashMap;
use uuid::Uuid;

use crate::bidi::network::{AddInterceptParams, InterceptPhase};
use crate::cdp::events::{
    EventAuthRequired, EventLoadingFailed, EventLoadingFinished, EventRequestPaused,
    EventRequestServedFromCache, EventRequestWillBeSent, EventRequestWillBeSentExtraInfo,
    EventResponseReceived, EventResponseReceivedExtraInfo,
};
use crate::cdp::CdpSession;
use crate::error::{Error, Result};
use crate::handler::context::BrowsingContextStorage;
use crate::handler::event_manager::EventManager;

pub mod pattern;
pub mod request;

pub use pattern::ParsedPattern;
pub use request::NetworkRequest;

/// Which Fetch stages the process currently needs; the union over all
/// registered intercepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchStages {
    pub request: bool,
    pub response: bool,
    pub auth: bool,
}

impl FetchStages {
    pub fn is_empty(self) -> bool {
        !self.request && !self.response && !self.auth
    }
}

#[derive(Debug, Clone)]
pub struct InterceptEntry {
    pub id: String,
    pub phases: Vec<InterceptPhase>,
    pub patterns: Vec<ParsedPattern>,
    /// Top-level context ids the intercept is limited to; `None` matches
    /// everything.
    pub contexts: Option<Vec<String>>,
}

impl InterceptEntry {
    fn matches(&self, phase: InterceptPhase, url: &str, top_level: Option<&str>) -> bool {
        if !self.phases.contains(&phase) {
            return false;
        }
        if let Some(contexts) = &self.contexts {
            match top_level {
                Some(top) if contexts.iter().any(|c| c == top) => {}
                _ => return false,
            }
        }
        self.patterns.is_empty() || self.patterns.iter().any(|p| p.matches_str(url))
    }
}

#[derive(Debug, Default)]
struct Inner {
    requests: FnvHashMap<String, NetworkRequest>,
    /// fetch id → network request id, for `Fetch.authRequired` correlation.
    fetch_to_request: HashMap<String, String>,
    intercepts: HashMap<String, InterceptEntry>,
}

#[derive(Debug, Clone)]
pub struct NetworkStorage {
    inner: Arc<Mutex<Inner>>,
    events: EventManager,
    contexts: BrowsingContextStorage,
}

impl NetworkStorage {
    pub fn new(events: EventManager, contexts: BrowsingContextStorage) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            events,
            contexts,
        }
    }

    pub fn add_intercept(&self, params: AddInterceptParams) -> Result<String> {
        if params.phases.is_empty() {
            return Err(Error::invalid_argument("at least one phase is required"));
        }
        let patterns = params
            .url_patterns
            .iter()
            .map(ParsedPattern::parse)
            .collect::<Result<Vec<_>>>()?;
        let contexts = match params.contexts {
            Some(ids) => {
                let mut tops = Vec::with_capacity(ids.len());
                for id in ids {
                    let context = self.contexts.get(&id)?;
                    if !context.is_top_level() {
                        return Err(Error::invalid_argument(format!(
                            "context {id} is not top-level"
                        )));
                    }
                    tops.push(id);
                }
                Some(tops)
            }
            None => None,
        };
        let id = Uuid::new_v4().to_string();
        self.lock().intercepts.insert(
            id.clone(),
            InterceptEntry {
                id: id.clone(),
                phases: params.phases,
                patterns,
                contexts,
            },
        );
        Ok(id)
    }

    pub fn remove_intercept(&self, id: &str) -> Result<()> {
        self.lock()
            .intercepts
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| Error::NoSuchIntercept(format!("no such intercept: {id}")))
    }

    pub fn fetch_stages(&self) -> FetchStages {
        let inner = self.lock();
        let mut stages = FetchStages::default();
        for intercept in inner.intercepts.values() {
            for phase in &intercept.phases {
                match phase {
                    InterceptPhase::BeforeRequestSent => stages.request = true,
                    InterceptPhase::ResponseStarted => stages.response = true,
                    InterceptPhase::AuthRequired => stages.auth = true,
                }
            }
        }
        stages
    }

    pub fn get_request(&self, id: &str) -> Result<NetworkRequest> {
        self.lock()
            .requests
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NoSuchRequest(format!("no such request: {id}")))
    }

    pub fn blocked_requests(&self) -> Vec<NetworkRequest> {
        self.lock()
            .requests
            .values()
            .filter(|r| r.phase().is_some())
            .cloned()
            .collect()
    }

    /// Await every currently blocked request passing its next phase; loops
    /// once more for interceptions that appeared during the wait.
    pub async fn drain_blocked(&self) {
        for _ in 0..2 {
            let waits: Vec<_> = self
                .blocked_requests()
                .iter()
                .map(|r| r.wait_next_phase())
                .collect();
            if waits.is_empty() {
                return;
            }
            let _ = futures::future::join_all(waits).await;
        }
    }

    pub fn on_request_will_be_sent(&self, event: EventRequestWillBeSent) {
        let request_id = event.request_id.inner().to_string();
        let (context_id, navigation_id) = self.resolve_context(event.frame_id.as_deref());

        let request = {
            let mut inner = self.lock();
            match inner.requests.get(&request_id).cloned() {
                Some(existing) if event.redirect_response.is_some() => {
                    // HTTP redirect: close out the old request and rotate in
                    // a successor with a bumped redirect count
                    if let Some(redirect_response) = event.redirect_response.clone() {
                        existing.on_redirect(redirect_response);
                    }
                    let (id, redirects, context, navigation) = existing.successor_seed();
                    let successor = NetworkRequest::new(
                        id,
                        redirects,
                        context,
                        navigation,
                        self.events.clone(),
                    );
                    inner.requests.insert(request_id.clone(), successor.clone());
                    successor
                }
                Some(existing) => existing,
                None => {
                    let request = NetworkRequest::new(
                        event.request_id.clone(),
                        0,
                        context_id.clone(),
                        navigation_id.clone(),
                        self.events.clone(),
                    );
                    inner.requests.insert(request_id.clone(), request.clone());
                    request
                }
            }
        };
        request.update_context(context_id, navigation_id);
        request.on_request_will_be_sent(event);
    }

    pub fn on_request_will_be_sent_extra_info(&self, event: &EventRequestWillBeSentExtraInfo) {
        let request = self.get_or_create(event.request_id.inner(), None);
        request.on_request_will_be_sent_extra_info();
    }

    pub fn on_request_paused(&self, event: EventRequestPaused, session: &CdpSession) {
        let fetch_id = event.request_id.clone();
        let Some(network_id) = event.network_id.clone() else {
            // nothing to correlate with: let it through untouched
            continue_paused(session.clone(), fetch_id, event.is_response_stage());
            return;
        };

        let request = self.get_or_create(network_id.inner(), event.frame_id.as_deref());
        {
            let mut inner = self.lock();
            inner
                .fetch_to_request
                .insert(fetch_id.clone(), network_id.inner().to_string());
        }

        let phase = if event.is_response_stage() {
            InterceptPhase::ResponseStarted
        } else {
            InterceptPhase::BeforeRequestSent
        };
        let matched = self.matching_intercepts(phase, &event.request.url, request.context_id());
        let blocked = !matched.is_empty();
        request.on_request_paused(event, matched);
        if !blocked {
            // paused only because some other intercept needed the stage
            continue_paused(
                session.clone(),
                fetch_id,
                phase == InterceptPhase::ResponseStarted,
            );
            request.finish_action();
        }
    }

    pub fn on_auth_required(&self, event: &EventAuthRequired, session: &CdpSession) {
        let request = {
            let inner = self.lock();
            inner
                .fetch_to_request
                .get(&event.request_id)
                .and_then(|id| inner.requests.get(id))
                .cloned()
        };
        let Some(request) = request else {
            // uncorrelated challenge: fall back to default browser behavior
            let session = session.clone();
            let fetch_id = event.request_id.clone();
            tokio::spawn(async move {
                let _ = session
                    .send(
                        "Fetch.continueWithAuth",
                        serde_json::json!({
                            "requestId": fetch_id,
                            "authChallengeResponse": {"response": "Default"},
                        }),
                    )
                    .await;
            });
            return;
        };
        let matched = self.matching_intercepts(
            InterceptPhase::AuthRequired,
            &event.request.url,
            request.context_id(),
        );
        let blocked = !matched.is_empty();
        request.on_auth_required(event.request_id.clone(), matched);
        if !blocked {
            let session = session.clone();
            let fetch_id = event.request_id.clone();
            tokio::spawn(async move {
                let _ = session
                    .send(
                        "Fetch.continueWithAuth",
                        serde_json::json!({
                            "requestId": fetch_id,
                            "authChallengeResponse": {"response": "Default"},
                        }),
                    )
                    .await;
            });
            request.finish_action();
        }
    }

    pub fn on_response_received(&self, event: EventResponseReceived) {
        let request = self.get_or_create(event.request_id.inner(), event.frame_id.as_deref());
        request.on_response_received(event.response);
    }

    pub fn on_response_extra_info(&self, event: &EventResponseReceivedExtraInfo) {
        if let Ok(request) = self.get_request(event.request_id.inner()) {
            request.on_response_extra_info();
        }
    }

    pub fn on_served_from_cache(&self, event: &EventRequestServedFromCache) {
        if let Ok(request) = self.get_request(event.request_id.inner()) {
            request.on_served_from_cache();
        }
    }

    pub fn on_loading_finished(&self, event: &EventLoadingFinished) {
        let removed = self.remove(event.request_id.inner());
        if let Some(request) = removed {
            request.on_loading_finished();
        }
    }

    pub fn on_loading_failed(&self, event: &EventLoadingFailed) {
        let removed = self.remove(event.request_id.inner());
        if let Some(request) = removed {
            request.on_loading_failed(&event.error_text);
        }
    }

    fn remove(&self, request_id: &str) -> Option<NetworkRequest> {
        let mut inner = self.lock();
        let request = inner.requests.remove(request_id);
        if let Some(request) = &request {
            if let Some(fetch_id) = request.fetch_id() {
                inner.fetch_to_request.remove(&fetch_id);
            }
        }
        request
    }

    fn get_or_create(&self, request_id: &str, frame_id: Option<&str>) -> NetworkRequest {
        let (context_id, navigation_id) = self.resolve_context(frame_id);
        let mut inner = self.lock();
        if let Some(request) = inner.requests.get(request_id).cloned() {
            return request;
        }
        let request = NetworkRequest::new(
            crate::cdp::RequestId::new(request_id),
            0,
            context_id,
            navigation_id,
            self.events.clone(),
        );
        inner
            .requests
            .insert(request_id.to_string(), request.clone());
        request
    }

    fn resolve_context(&self, frame_id: Option<&str>) -> (Option<String>, Option<String>) {
        match frame_id {
            Some(frame_id) => match self.contexts.find(frame_id) {
                Some(context) => {
                    let navigation = context.navigation.current_navigation_id();
                    (Some(frame_id.to_string()), navigation)
                }
                None => (Some(frame_id.to_string()), None),
            },
            None => (None, None),
        }
    }

    fn matching_intercepts(
        &self,
        phase: InterceptPhase,
        url: &str,
        context_id: Option<String>,
    ) -> Vec<String> {
        let top_level = context_id
            .as_deref()
            .and_then(|id| self.contexts.top_level_id(id).ok());
        let inner = self.lock();
        let mut matched: Vec<String> = inner
            .intercepts
            .values()
            .filter(|intercept| intercept.matches(phase, url, top_level.as_deref()))
            .map(|intercept| intercept.id.clone())
            .collect();
        matched.sort();
        matched
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("network storage poisoned")
    }
}

/// Let an unmatched paused request through on whichever stage it is stuck.
fn continue_paused(session: CdpSession, fetch_id: String, response_stage: bool) {
    tokio::spawn(async move {
        let method = if response_stage {
            "Fetch.continueResponse"
        } else {
            "Fetch.continueRequest"
        };
        if let Err(err) = session
            .send(method, serde_json::json!({"requestId": fetch_id}))
            .await
        {
            if !err.is_session_gone() {
                tracing::debug!("auto-continue failed: {err}");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bidi::network::UrlPattern;
    use crate::handler::test_support::test_event_manager;

    fn storage() -> (
        NetworkStorage,
        crate::handler::subscription::SubscriptionManager,
        tokio::sync::mpsc::UnboundedReceiver<crate::bidi::OutgoingMessage>,
    ) {
        let (events, subscriptions, out) = test_event_manager();
        let contexts = BrowsingContextStorage::new();
        (NetworkStorage::new(events, contexts), subscriptions, out)
    }

    fn add_intercept(storage: &NetworkStorage, phase: InterceptPhase, pattern: &str) -> String {
        storage
            .add_intercept(AddInterceptParams {
                phases: vec![phase],
                contexts: None,
                url_patterns: vec![UrlPattern::String {
                    pattern: pattern.to_string(),
                }],
            })
            .unwrap()
    }

    #[tokio::test]
    async fn fetch_stages_follow_intercepts() {
        let (storage, _subs, _out) = storage();
        assert!(storage.fetch_stages().is_empty());

        let id = add_intercept(&storage, InterceptPhase::BeforeRequestSent, "http://a.example");
        assert_eq!(
            storage.fetch_stages(),
            FetchStages {
                request: true,
                response: false,
                auth: false
            }
        );
        let auth = add_intercept(&storage, InterceptPhase::AuthRequired, "http://a.example");
        assert!(storage.fetch_stages().auth);

        storage.remove_intercept(&id).unwrap();
        storage.remove_intercept(&auth).unwrap();
        assert!(storage.fetch_stages().is_empty());
        assert_eq!(
            storage.remove_intercept("missing").unwrap_err().code(),
            "no such intercept"
        );
    }

    #[tokio::test]
    async fn empty_phases_are_invalid() {
        let (storage, _subs, _out) = storage();
        let err = storage
            .add_intercept(AddInterceptParams {
                phases: vec![],
                contexts: None,
                url_patterns: vec![],
            })
            .unwrap_err();
        assert_eq!(err.code(), "invalid argument");
    }

    #[tokio::test]
    async fn redirect_rotates_request_with_bumped_count() {
        let (storage, subs, mut out) = storage();
        subs.subscribe("network", None, &None).unwrap();

        storage.on_request_will_be_sent(
            serde_json::from_value(serde_json::json!({
                "requestId": "req-1",
                "request": {"url": "http://a.example/", "method": "GET"},
                "initiator": {"type": "other"},
            }))
            .unwrap(),
        );
        storage.on_request_will_be_sent_extra_info(
            &serde_json::from_value(serde_json::json!({"requestId": "req-1"})).unwrap(),
        );

        // redirect arrives under the same request id
        storage.on_request_will_be_sent(
            serde_json::from_value(serde_json::json!({
                "requestId": "req-1",
                "request": {"url": "http://b.example/", "method": "GET"},
                "initiator": {"type": "other"},
                "redirectResponse": {"url": "http://a.example/", "status": 301, "statusText": "Moved"},
            }))
            .unwrap(),
        );
        storage.on_request_will_be_sent_extra_info(
            &serde_json::from_value(serde_json::json!({"requestId": "req-1"})).unwrap(),
        );

        let request = storage.get_request("req-1").unwrap();
        assert_eq!(request.redirect_count(), 1);

        // first beforeRequestSent, then the redirect's response pair, then
        // the successor's beforeRequestSent
        let mut methods = Vec::new();
        for _ in 0..4 {
            match out.recv().await.unwrap() {
                crate::bidi::OutgoingMessage::Event { method, params, .. } => {
                    methods.push((method, params))
                }
                other => panic!("unexpected: {other:?}"),
            }
        }
        assert_eq!(methods[0].0, "network.beforeRequestSent");
        assert_eq!(methods[0].1["redirectCount"], 0);
        assert_eq!(methods[1].0, "network.responseStarted");
        assert_eq!(methods[2].0, "network.responseCompleted");
        assert_eq!(methods[3].0, "network.beforeRequestSent");
        assert_eq!(methods[3].1["redirectCount"], 1);
        assert_eq!(methods[3].1["request"]["url"], "http://b.example/");
    }

    #[tokio::test]
    async fn unknown_request_actions_fail() {
        let (storage, _subs, _out) = storage();
        assert_eq!(
            storage.get_request("ghost").unwrap_err().code(),
            "no such request"
        );
    }
}
