//! One logical network request, correlated from the `Network.*` and
//! `Fetch.*` event streams. The two streams race: `beforeRequestSent` goes
//! out once the `requestWillBeSent` side and either the extra-info or the
//! paused side have arrived, whichever order they show up in. Requests that
//! never produce a second side (data: URLs, cache hits) are flushed by the
//! response side so exactly one event is emitted.

use std::sync::{Arc, Mutex};

use crate::bidi;
use crate::bidi::network::{
    AuthRequiredParams, BaseParameters, BeforeRequestSentParams, BytesValue, FetchErrorParams,
    FetchTimingInfo, Header, Initiator, InterceptPhase, RequestData, ResponseContent,
    ResponseData, ResponseStartedParams,
};
use crate::cdp::events::{EventRequestPaused, EventRequestWillBeSent, ResponsePayload};
use crate::cdp::RequestId;
use crate::deferred::Deferred;
use crate::error::{Error, Result};
use crate::handler::event_manager::EventManager;

/// Convert a CDP header object map into the BiDi header list.
pub fn headers_from_value(value: &serde_json::Value) -> Vec<Header> {
    value
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(name, value)| Header {
                    name: name.clone(),
                    value: BytesValue::string(value.as_str().unwrap_or_default()),
                })
                .collect()
        })
        .unwrap_or_default()
}

fn headers_size(headers: &[Header]) -> u64 {
    headers
        .iter()
        .map(|h| {
            let (BytesValue::String { value } | BytesValue::Base64 { value }) = &h.value;
            (h.name.len() + value.len() + 4) as u64
        })
        .sum()
}

#[derive(Debug)]
struct Inner {
    request_id: RequestId,
    fetch_id: Option<String>,
    context_id: Option<String>,
    navigation_id: Option<String>,
    redirect_count: u64,
    will_be_sent: Option<EventRequestWillBeSent>,
    extra_info_received: bool,
    paused: Option<EventRequestPaused>,
    response: Option<ResponsePayload>,
    response_extra_received: bool,
    served_from_cache: bool,
    phase: Option<InterceptPhase>,
    next_phase: Deferred<()>,
    matched_intercepts: Vec<String>,
    before_sent_emitted: bool,
    response_started_emitted: bool,
}

#[derive(Debug, Clone)]
pub struct NetworkRequest {
    inner: Arc<Mutex<Inner>>,
    events: EventManager,
}

impl NetworkRequest {
    pub fn new(
        request_id: RequestId,
        redirect_count: u64,
        context_id: Option<String>,
        navigation_id: Option<String>,
        events: EventManager,
    ) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                request_id,
                fetch_id: None,
                context_id,
                navigation_id,
                redirect_count,
                will_be_sent: None,
                extra_info_received: false,
                paused: None,
                response: None,
                response_extra_received: false,
                served_from_cache: false,
                phase: None,
                next_phase: Deferred::new(),
                matched_intercepts: Vec::new(),
                before_sent_emitted: false,
                response_started_emitted: false,
            })),
            events,
        }
    }

    pub fn request_id(&self) -> RequestId {
        self.lock().request_id.clone()
    }

    pub fn fetch_id(&self) -> Option<String> {
        self.lock().fetch_id.clone()
    }

    pub fn url(&self) -> Option<String> {
        let inner = self.lock();
        inner
            .will_be_sent
            .as_ref()
            .map(|ev| full_url(ev))
            .or_else(|| inner.paused.as_ref().map(|ev| ev.request.url.clone()))
    }

    pub fn context_id(&self) -> Option<String> {
        self.lock().context_id.clone()
    }

    pub fn phase(&self) -> Option<InterceptPhase> {
        self.lock().phase
    }

    pub fn is_blocked(&self) -> bool {
        let inner = self.lock();
        inner.phase.is_some() && !inner.matched_intercepts.is_empty()
    }

    /// Future resolving when the request leaves its current interception
    /// phase; used to drain blocked requests before disabling Fetch.
    pub fn wait_next_phase(&self) -> impl std::future::Future<Output = Result<()>> {
        self.lock().next_phase.wait()
    }

    /// Late context resolution: extra-info events carry no frame id, so a
    /// request created from one learns its context when the main event
    /// arrives.
    pub fn update_context(&self, context_id: Option<String>, navigation_id: Option<String>) {
        let mut inner = self.lock();
        if inner.context_id.is_none() {
            inner.context_id = context_id;
        }
        if inner.navigation_id.is_none() {
            inner.navigation_id = navigation_id;
        }
    }

    pub fn on_request_will_be_sent(&self, event: EventRequestWillBeSent) {
        let mut inner = self.lock();
        let data_url = event.request.url.starts_with("data:");
        inner.will_be_sent = Some(event);
        if data_url {
            // data: URLs never produce extra info or pauses
            inner.extra_info_received = true;
        }
        self.try_emit_before_request_sent(&mut inner);
    }

    pub fn on_request_will_be_sent_extra_info(&self) {
        let mut inner = self.lock();
        inner.extra_info_received = true;
        self.try_emit_before_request_sent(&mut inner);
    }

    /// A matched or unmatched pause on the request stage; matched intercept
    /// ids make the request blocked.
    pub fn on_request_paused(&self, event: EventRequestPaused, matched: Vec<String>) {
        let mut inner = self.lock();
        inner.fetch_id = Some(event.request_id.clone());
        if event.is_response_stage() {
            inner.phase = Some(InterceptPhase::ResponseStarted);
            inner.matched_intercepts = matched;
            inner.paused = Some(event);
            self.try_emit_before_request_sent(&mut inner);
            self.emit_response_started_from_pause(&mut inner);
        } else {
            inner.phase = Some(InterceptPhase::BeforeRequestSent);
            inner.matched_intercepts = matched;
            inner.paused = Some(event);
            self.try_emit_before_request_sent(&mut inner);
        }
    }

    pub fn on_auth_required(&self, fetch_id: String, matched: Vec<String>) {
        let mut inner = self.lock();
        inner.fetch_id = Some(fetch_id);
        inner.phase = Some(InterceptPhase::AuthRequired);
        inner.matched_intercepts = matched;
        // only emit once the request is correlated
        if inner.will_be_sent.is_none() && inner.paused.is_none() {
            return;
        }
        self.try_emit_before_request_sent(&mut inner);
        let params = AuthRequiredParams {
            base: self.base_params(&inner),
            response: self.response_data(&inner),
        };
        self.emit(&inner, "network.authRequired", &params);
    }

    pub fn on_response_received(&self, response: ResponsePayload) {
        let mut inner = self.lock();
        if response.from_disk_cache.unwrap_or(false) || response.from_memory_cache.unwrap_or(false)
        {
            inner.served_from_cache = true;
        }
        inner.response = Some(response);
        self.try_emit_before_request_sent(&mut inner);
        self.try_emit_response_started(&mut inner, false);
    }

    pub fn on_response_extra_info(&self) {
        let mut inner = self.lock();
        inner.response_extra_received = true;
        self.try_emit_response_started(&mut inner, false);
    }

    pub fn on_served_from_cache(&self) {
        self.lock().served_from_cache = true;
    }

    pub fn on_loading_finished(&self) {
        let mut inner = self.lock();
        // whatever is still pending gets flushed so the completed event is
        // never emitted alone
        self.try_emit_before_request_sent(&mut inner);
        self.try_emit_response_started(&mut inner, true);
        let params = ResponseStartedParams {
            base: self.base_params(&inner),
            response: self.response_data(&inner),
        };
        self.emit(&inner, "network.responseCompleted", &params);
    }

    pub fn on_loading_failed(&self, error_text: &str) {
        let mut inner = self.lock();
        self.try_emit_before_request_sent(&mut inner);
        let params = FetchErrorParams {
            base: self.base_params(&inner),
            error_text: error_text.to_string(),
        };
        self.emit(&inner, "network.fetchError", &params);
        inner.next_phase.resolve(());
    }

    /// An HTTP redirect closes this request: the redirect response is
    /// reported as started + completed, after which the storage rotates in
    /// a successor with `redirect_count + 1`.
    pub fn on_redirect(&self, redirect_response: ResponsePayload) {
        let mut inner = self.lock();
        self.try_emit_before_request_sent(&mut inner);
        inner.response = Some(redirect_response);
        self.try_emit_response_started(&mut inner, true);
        let params = ResponseStartedParams {
            base: self.base_params(&inner),
            response: self.response_data(&inner),
        };
        self.emit(&inner, "network.responseCompleted", &params);
        inner.next_phase.resolve(());
    }

    pub fn redirect_count(&self) -> u64 {
        self.lock().redirect_count
    }

    /// Validate that a blocked-request action is allowed in the current
    /// phase and hand back the fetch id to address CDP with.
    pub fn begin_action(&self, allowed: &[InterceptPhase], action: &str) -> Result<String> {
        let inner = self.lock();
        let phase = inner.phase.ok_or_else(|| {
            Error::invalid_argument(format!(
                "{action}: request {} is not blocked",
                inner.request_id
            ))
        })?;
        if !allowed.contains(&phase) {
            return Err(Error::invalid_argument(format!(
                "{action} is not allowed in the {phase:?} phase"
            )));
        }
        inner.fetch_id.clone().ok_or_else(|| {
            Error::invalid_argument(format!(
                "{action}: request {} has no interception id",
                inner.request_id
            ))
        })
    }

    /// The action went through on the CDP side: the request moves on to its
    /// next phase and anyone draining blocked requests is woken.
    pub fn finish_action(&self) {
        let mut inner = self.lock();
        inner.phase = None;
        inner.matched_intercepts.clear();
        inner.next_phase.resolve(());
        inner.next_phase = Deferred::new();
    }

    /// The context and current state carried over into the redirect
    /// successor.
    pub(crate) fn successor_seed(&self) -> (RequestId, u64, Option<String>, Option<String>) {
        let inner = self.lock();
        (
            inner.request_id.clone(),
            inner.redirect_count + 1,
            inner.context_id.clone(),
            inner.navigation_id.clone(),
        )
    }

    fn try_emit_before_request_sent(&self, inner: &mut Inner) {
        if inner.before_sent_emitted {
            return;
        }
        let Some(will_be_sent) = inner.will_be_sent.as_ref() else {
            return;
        };
        let second_side = inner.extra_info_received
            || inner.paused.is_some()
            || inner.response.is_some()
            || inner.served_from_cache;
        if !second_side {
            return;
        }
        let initiator_kind = will_be_sent
            .initiator
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or("other")
            .to_string();
        inner.before_sent_emitted = true;
        let params = BeforeRequestSentParams {
            base: self.base_params(inner),
            initiator: Initiator {
                kind: initiator_kind,
            },
        };
        self.emit(inner, "network.beforeRequestSent", &params);
    }

    fn try_emit_response_started(&self, inner: &mut Inner, flush: bool) {
        if inner.response_started_emitted || inner.response.is_none() {
            return;
        }
        let second_side = inner.response_extra_received || inner.served_from_cache || flush;
        if !second_side {
            return;
        }
        inner.response_started_emitted = true;
        let params = ResponseStartedParams {
            base: self.base_params(inner),
            response: self.response_data(inner),
        };
        self.emit(inner, "network.responseStarted", &params);
    }

    fn emit_response_started_from_pause(&self, inner: &mut Inner) {
        if inner.response_started_emitted {
            return;
        }
        inner.response_started_emitted = true;
        let params = ResponseStartedParams {
            base: self.base_params(inner),
            response: self.response_data(inner),
        };
        self.emit(inner, "network.responseStarted", &params);
    }

    fn base_params(&self, inner: &Inner) -> BaseParameters {
        let is_blocked = inner.phase.is_some() && !inner.matched_intercepts.is_empty();
        BaseParameters {
            context: inner.context_id.clone(),
            is_blocked,
            navigation: inner.navigation_id.clone(),
            redirect_count: inner.redirect_count,
            request: self.request_data(inner),
            timestamp: bidi::timestamp(),
            intercepts: if is_blocked {
                Some(inner.matched_intercepts.clone())
            } else {
                None
            },
        }
    }

    fn request_data(&self, inner: &Inner) -> RequestData {
        let (url, method, headers, body_size, request_time) = match &inner.will_be_sent {
            Some(ev) => (
                full_url(ev),
                ev.request.method.clone(),
                headers_from_value(&ev.request.headers),
                ev.request.post_data.as_ref().map(|d| d.len() as u64),
                ev.timestamp,
            ),
            None => match &inner.paused {
                Some(ev) => (
                    ev.request.url.clone(),
                    ev.request.method.clone(),
                    headers_from_value(&ev.request.headers),
                    ev.request.post_data.as_ref().map(|d| d.len() as u64),
                    0.0,
                ),
                None => (String::new(), "GET".to_string(), Vec::new(), None, 0.0),
            },
        };
        let size = headers_size(&headers);
        RequestData {
            request: inner.request_id.inner().to_string(),
            url,
            method,
            headers,
            cookies: Vec::new(),
            headers_size: size,
            body_size,
            timings: FetchTimingInfo {
                request_time,
                ..Default::default()
            },
        }
    }

    fn response_data(&self, inner: &Inner) -> ResponseData {
        if let Some(response) = &inner.response {
            let headers = headers_from_value(&response.headers);
            let size = headers_size(&headers);
            return ResponseData {
                url: response.url.clone(),
                protocol: response.protocol.clone().unwrap_or_default(),
                status: response.status,
                status_text: response.status_text.clone(),
                from_cache: inner.served_from_cache,
                headers,
                mime_type: response.mime_type.clone(),
                bytes_received: response.encoded_data_length.unwrap_or(0.0) as u64,
                headers_size: Some(size),
                body_size: None,
                content: ResponseContent { size: 0 },
            };
        }
        // response stage pause: the data lives on the paused event
        let (status, status_text, headers, url) = match &inner.paused {
            Some(ev) => (
                ev.response_status_code.unwrap_or(0),
                ev.response_status_text.clone().unwrap_or_default(),
                ev.response_headers
                    .as_ref()
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|h| Header {
                                name: h.name.clone(),
                                value: BytesValue::string(&h.value),
                            })
                            .collect()
                    })
                    .unwrap_or_default(),
                ev.request.url.clone(),
            ),
            None => (0, String::new(), Vec::new(), String::new()),
        };
        let size = headers_size(&headers);
        ResponseData {
            url,
            protocol: String::new(),
            status,
            status_text,
            from_cache: inner.served_from_cache,
            headers,
            mime_type: String::new(),
            bytes_received: 0,
            headers_size: Some(size),
            body_size: None,
            content: ResponseContent { size: 0 },
        }
    }

    fn emit<T: serde::Serialize>(&self, inner: &Inner, name: &'static str, params: &T) {
        let params = match serde_json::to_value(params) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!("failed to serialize {name} params: {err}");
                return;
            }
        };
        self.events.emit(name, inner.context_id.clone(), params);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("network request poisoned")
    }
}

fn full_url(event: &EventRequestWillBeSent) -> String {
    match &event.request.url_fragment {
        Some(fragment) => format!("{}{fragment}", event.request.url),
        None => event.request.url.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::test_support::test_event_manager;

    fn will_be_sent(url: &str) -> EventRequestWillBeSent {
        serde_json::from_value(serde_json::json!({
            "requestId": "req-1",
            "request": {"url": url, "method": "GET", "headers": {"Accept": "*/*"}},
            "initiator": {"type": "parser"},
        }))
        .unwrap()
    }

    fn paused(url: &str) -> EventRequestPaused {
        serde_json::from_value(serde_json::json!({
            "requestId": "fetch-1",
            "request": {"url": url, "method": "GET"},
            "networkId": "req-1",
        }))
        .unwrap()
    }

    async fn expect_event(
        out: &mut tokio::sync::mpsc::UnboundedReceiver<crate::bidi::OutgoingMessage>,
        expected: &str,
    ) -> serde_json::Value {
        match out.recv().await.unwrap() {
            crate::bidi::OutgoingMessage::Event { method, params, .. } => {
                assert_eq!(method, expected);
                params
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    fn request(events: EventManager) -> NetworkRequest {
        NetworkRequest::new(RequestId::new("req-1"), 0, Some("ctx".into()), None, events)
    }

    #[tokio::test]
    async fn before_request_sent_needs_both_sides() {
        let (events, subscriptions, mut out) = test_event_manager();
        subscriptions.subscribe("network", None, &None).unwrap();
        let req = request(events);

        req.on_request_will_be_sent(will_be_sent("http://example.com/"));
        // nothing yet: the second side is missing
        req.on_request_will_be_sent_extra_info();
        let params = expect_event(&mut out, "network.beforeRequestSent").await;
        assert_eq!(params["isBlocked"], false);
        assert_eq!(params["request"]["url"], "http://example.com/");
        assert_eq!(params["initiator"]["type"], "parser");
    }

    #[tokio::test]
    async fn reverse_order_with_intercept_is_blocked() {
        // Fetch.requestPaused can beat Network.requestWillBeSent
        let (events, subscriptions, mut out) = test_event_manager();
        subscriptions.subscribe("network", None, &None).unwrap();
        let req = request(events);

        req.on_request_paused(paused("http://www.google.com/"), vec!["intercept-1".into()]);
        req.on_request_will_be_sent(will_be_sent("http://www.google.com/"));

        let params = expect_event(&mut out, "network.beforeRequestSent").await;
        assert_eq!(params["isBlocked"], true);
        assert_eq!(params["intercepts"][0], "intercept-1");
        assert!(req.is_blocked());

        // no duplicate emission when the extra info trickles in afterwards
        req.on_request_will_be_sent_extra_info();
        req.finish_action();
        assert!(!req.is_blocked());
    }

    #[tokio::test]
    async fn response_correlation_either_order() {
        let (events, subscriptions, mut out) = test_event_manager();
        subscriptions.subscribe("network", None, &None).unwrap();
        let req = request(events);
        req.on_request_will_be_sent(will_be_sent("http://example.com/"));
        req.on_request_will_be_sent_extra_info();
        let _ = expect_event(&mut out, "network.beforeRequestSent").await;

        req.on_response_extra_info();
        req.on_response_received(
            serde_json::from_value(serde_json::json!({
                "url": "http://example.com/",
                "status": 200,
                "statusText": "OK",
                "headers": {"Content-Type": "text/html"},
                "mimeType": "text/html"
            }))
            .unwrap(),
        );
        let params = expect_event(&mut out, "network.responseStarted").await;
        assert_eq!(params["response"]["status"], 200);

        req.on_loading_finished();
        let params = expect_event(&mut out, "network.responseCompleted").await;
        assert_eq!(params["response"]["mimeType"], "text/html");
    }

    #[tokio::test]
    async fn loading_failed_emits_fetch_error() {
        let (events, subscriptions, mut out) = test_event_manager();
        subscriptions.subscribe("network", None, &None).unwrap();
        let req = request(events);
        req.on_request_will_be_sent(will_be_sent("http://example.com/"));
        req.on_loading_failed("net::ERR_CONNECTION_REFUSED");
        let _ = expect_event(&mut out, "network.beforeRequestSent").await;
        let params = expect_event(&mut out, "network.fetchError").await;
        assert_eq!(params["errorText"], "net::ERR_CONNECTION_REFUSED");
    }

    #[tokio::test]
    async fn phase_assertions_guard_actions() {
        let (events, _subscriptions, _out) = test_event_manager();
        let req = request(events);
        let err = req
            .begin_action(&[InterceptPhase::BeforeRequestSent], "network.continueRequest")
            .unwrap_err();
        assert_eq!(err.code(), "invalid argument");

        req.on_request_paused(paused("http://example.com/"), vec!["i".into()]);
        assert!(req
            .begin_action(&[InterceptPhase::BeforeRequestSent], "network.continueRequest")
            .is_ok());
        let err = req
            .begin_action(&[InterceptPhase::AuthRequired], "network.continueWithAuth")
            .unwrap_err();
        assert_eq!(err.code(), "invalid argument");
    }

    #[tokio::test]
    async fn data_url_emits_immediately() {
        let (events, subscriptions, mut out) = test_event_manager();
        subscriptions.subscribe("network", None, &None).unwrap();
        let req = request(events);
        req.on_request_will_be_sent(will_be_sent("data:text/plain,hi"));
        let params = expect_event(&mut out, "network.beforeRequestSent").await;
        assert_eq!(params["request"]["url"], "data:text/plain,hi");
    }
}
