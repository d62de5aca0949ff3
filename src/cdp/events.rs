//! Hand-written typed views over the CDP events the core consumes. Only the
//! fields the core reads are modeled; everything else stays in the raw
//! payload, which is kept around for the `goog:cdp` passthrough.

use serde::Deserialize;

use super::{LoaderId, RequestId, SessionId, TargetId};

/// One event as delivered by the connection.
#[derive(Debug, Clone)]
pub struct CdpEventMessage {
    pub session_id: Option<SessionId>,
    pub method: String,
    pub params: serde_json::Value,
}

impl CdpEventMessage {
    pub fn new(
        session_id: Option<SessionId>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Self {
            session_id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameInfo {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub url_fragment: Option<String>,
    #[serde(default)]
    pub loader_id: Option<LoaderId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrameAttached {
    pub frame_id: String,
    pub parent_frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrameDetached {
    pub frame_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrameSubtreeWillBeDetached {
    pub frame_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrameNavigated {
    pub frame: FrameInfo,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLifecycleEvent {
    pub frame_id: String,
    pub loader_id: LoaderId,
    pub name: String,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNavigatedWithinDocument {
    pub frame_id: String,
    pub url: String,
    /// `fragment` | `historyApi` | `other`
    #[serde(default)]
    pub navigation_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFrameRequestedNavigation {
    pub frame_id: String,
    pub url: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventJavascriptDialogOpening {
    #[serde(default)]
    pub url: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub default_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventJavascriptDialogClosed {
    pub result: bool,
    #[serde(default)]
    pub user_input: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDownloadWillBegin {
    pub frame_id: String,
    pub url: String,
    #[serde(default)]
    pub suggested_filename: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFileChooserOpened {
    pub frame_id: String,
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub backend_node_id: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPayload {
    pub url: String,
    #[serde(default)]
    pub url_fragment: Option<String>,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default)]
    pub post_data: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub status: u64,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub protocol: Option<String>,
    #[serde(default)]
    pub from_disk_cache: Option<bool>,
    #[serde(default)]
    pub from_memory_cache: Option<bool>,
    #[serde(default)]
    pub encoded_data_length: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequestWillBeSent {
    pub request_id: RequestId,
    #[serde(default)]
    pub loader_id: Option<LoaderId>,
    pub request: RequestPayload,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub wall_time: f64,
    #[serde(default)]
    pub initiator: serde_json::Value,
    #[serde(default)]
    pub redirect_response: Option<ResponsePayload>,
    #[serde(default)]
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequestWillBeSentExtraInfo {
    pub request_id: RequestId,
    #[serde(default)]
    pub headers: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponseReceived {
    pub request_id: RequestId,
    #[serde(default)]
    pub loader_id: Option<LoaderId>,
    pub response: ResponsePayload,
    #[serde(default)]
    pub frame_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventResponseReceivedExtraInfo {
    pub request_id: RequestId,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default)]
    pub status_code: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLoadingFailed {
    pub request_id: RequestId,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub canceled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLoadingFinished {
    pub request_id: RequestId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequestServedFromCache {
    pub request_id: RequestId,
}

/// Header list shape used by the `Fetch` domain.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRequestPaused {
    /// The fetch-domain id of the paused request, distinct from the network
    /// request id carried in `network_id`.
    pub request_id: String,
    pub request: RequestPayload,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub response_status_code: Option<u64>,
    #[serde(default)]
    pub response_status_text: Option<String>,
    #[serde(default)]
    pub response_headers: Option<Vec<HeaderEntry>>,
    #[serde(default)]
    pub network_id: Option<RequestId>,
}

impl EventRequestPaused {
    /// A paused event with response data belongs to the response stage.
    pub fn is_response_stage(&self) -> bool {
        self.response_status_code.is_some() || self.response_headers.is_some()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAuthRequired {
    pub request_id: String,
    pub request: RequestPayload,
    #[serde(default)]
    pub frame_id: Option<String>,
    #[serde(default)]
    pub auth_challenge: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub target_id: TargetId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub attached: bool,
    #[serde(default)]
    pub opener_id: Option<TargetId>,
    #[serde(default)]
    pub opener_frame_id: Option<String>,
    #[serde(default)]
    pub browser_context_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAttachedToTarget {
    pub session_id: SessionId,
    pub target_info: TargetInfo,
    #[serde(default)]
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDetachedFromTarget {
    pub session_id: SessionId,
    #[serde(default)]
    pub target_id: Option<TargetId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTargetInfoChanged {
    pub target_info: TargetInfo,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContextDescription {
    pub id: i64,
    #[serde(default)]
    pub origin: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub unique_id: String,
    #[serde(default)]
    pub aux_data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventExecutionContextCreated {
    pub context: ExecutionContextDescription,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventExecutionContextDestroyed {
    #[serde(default)]
    pub execution_context_id: i64,
    #[serde(default)]
    pub execution_context_unique_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventConsoleApiCalled {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<serde_json::Value>,
    #[serde(default)]
    pub execution_context_id: i64,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub stack_trace: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventExceptionThrown {
    #[serde(default)]
    pub timestamp: f64,
    pub exception_details: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBindingCalled {
    pub name: String,
    pub payload: String,
    #[serde(default)]
    pub execution_context_id: i64,
}

/// Every CDP event the core routes, plus a raw fallthrough for everything
/// else (still forwarded to `goog:cdp` subscribers).
#[derive(Debug, Clone)]
pub enum CdpEvent {
    PageFrameAttached(EventFrameAttached),
    PageFrameDetached(EventFrameDetached),
    PageFrameSubtreeWillBeDetached(EventFrameSubtreeWillBeDetached),
    PageFrameNavigated(Box<EventFrameNavigated>),
    PageLifecycleEvent(EventLifecycleEvent),
    PageNavigatedWithinDocument(EventNavigatedWithinDocument),
    PageFrameRequestedNavigation(EventFrameRequestedNavigation),
    PageJavascriptDialogOpening(EventJavascriptDialogOpening),
    PageJavascriptDialogClosed(EventJavascriptDialogClosed),
    PageDownloadWillBegin(EventDownloadWillBegin),
    PageFileChooserOpened(EventFileChooserOpened),
    NetworkRequestWillBeSent(Box<EventRequestWillBeSent>),
    NetworkRequestWillBeSentExtraInfo(EventRequestWillBeSentExtraInfo),
    NetworkResponseReceived(Box<EventResponseReceived>),
    NetworkResponseReceivedExtraInfo(EventResponseReceivedExtraInfo),
    NetworkLoadingFailed(EventLoadingFailed),
    NetworkLoadingFinished(EventLoadingFinished),
    NetworkRequestServedFromCache(EventRequestServedFromCache),
    FetchRequestPaused(Box<EventRequestPaused>),
    FetchAuthRequired(Box<EventAuthRequired>),
    TargetAttachedToTarget(Box<EventAttachedToTarget>),
    TargetDetachedFromTarget(EventDetachedFromTarget),
    TargetInfoChanged(Box<EventTargetInfoChanged>),
    RuntimeExecutionContextCreated(EventExecutionContextCreated),
    RuntimeExecutionContextDestroyed(EventExecutionContextDestroyed),
    RuntimeExecutionContextsCleared,
    RuntimeConsoleApiCalled(Box<EventConsoleApiCalled>),
    RuntimeExceptionThrown(Box<EventExceptionThrown>),
    RuntimeBindingCalled(EventBindingCalled),
    Other,
}

impl CdpEvent {
    /// Parse the typed view of an event. Unknown methods map onto
    /// [`CdpEvent::Other`]; malformed payloads of known methods are an
    /// error so they never get silently half-handled.
    pub fn parse(msg: &CdpEventMessage) -> Result<CdpEvent, serde_json::Error> {
        let p = msg.params.clone();
        Ok(match msg.method.as_str() {
            "Page.frameAttached" => CdpEvent::PageFrameAttached(serde_json::from_value(p)?),
            "Page.frameDetached" => CdpEvent::PageFrameDetached(serde_json::from_value(p)?),
            "Page.frameSubtreeWillBeDetached" => {
                CdpEvent::PageFrameSubtreeWillBeDetached(serde_json::from_value(p)?)
            }
            "Page.frameNavigated" => CdpEvent::PageFrameNavigated(serde_json::from_value(p)?),
            "Page.lifecycleEvent" => CdpEvent::PageLifecycleEvent(serde_json::from_value(p)?),
            "Page.navigatedWithinDocument" => {
                CdpEvent::PageNavigatedWithinDocument(serde_json::from_value(p)?)
            }
            "Page.frameRequestedNavigation" => {
                CdpEvent::PageFrameRequestedNavigation(serde_json::from_value(p)?)
            }
            "Page.javascriptDialogOpening" => {
                CdpEvent::PageJavascriptDialogOpening(serde_json::from_value(p)?)
            }
            "Page.javascriptDialogClosed" => {
                CdpEvent::PageJavascriptDialogClosed(serde_json::from_value(p)?)
            }
            "Page.downloadWillBegin" => {
                CdpEvent::PageDownloadWillBegin(serde_json::from_value(p)?)
            }
            "Page.fileChooserOpened" => {
                CdpEvent::PageFileChooserOpened(serde_json::from_value(p)?)
            }
            "Network.requestWillBeSent" => {
                CdpEvent::NetworkRequestWillBeSent(serde_json::from_value(p)?)
            }
            "Network.requestWillBeSentExtraInfo" => {
                CdpEvent::NetworkRequestWillBeSentExtraInfo(serde_json::from_value(p)?)
            }
            "Network.responseReceived" => {
                CdpEvent::NetworkResponseReceived(serde_json::from_value(p)?)
            }
            "Network.responseReceivedExtraInfo" => {
                CdpEvent::NetworkResponseReceivedExtraInfo(serde_json::from_value(p)?)
            }
            "Network.loadingFailed" => CdpEvent::NetworkLoadingFailed(serde_json::from_value(p)?),
            "Network.loadingFinished" => {
                CdpEvent::NetworkLoadingFinished(serde_json::from_value(p)?)
            }
            "Network.requestServedFromCache" => {
                CdpEvent::NetworkRequestServedFromCache(serde_json::from_value(p)?)
            }
            "Fetch.requestPaused" => CdpEvent::FetchRequestPaused(serde_json::from_value(p)?),
            "Fetch.authRequired" => CdpEvent::FetchAuthRequired(serde_json::from_value(p)?),
            "Target.attachedToTarget" => {
                CdpEvent::TargetAttachedToTarget(serde_json::from_value(p)?)
            }
            "Target.detachedFromTarget" => {
                CdpEvent::TargetDetachedFromTarget(serde_json::from_value(p)?)
            }
            "Target.targetInfoChanged" => CdpEvent::TargetInfoChanged(serde_json::from_value(p)?),
            "Runtime.executionContextCreated" => {
                CdpEvent::RuntimeExecutionContextCreated(serde_json::from_value(p)?)
            }
            "Runtime.executionContextDestroyed" => {
                CdpEvent::RuntimeExecutionContextDestroyed(serde_json::from_value(p)?)
            }
            "Runtime.executionContextsCleared" => CdpEvent::RuntimeExecutionContextsCleared,
            "Runtime.consoleAPICalled" => {
                CdpEvent::RuntimeConsoleApiCalled(serde_json::from_value(p)?)
            }
            "Runtime.exceptionThrown" => {
                CdpEvent::RuntimeExceptionThrown(serde_json::from_value(p)?)
            }
            "Runtime.bindingCalled" => CdpEvent::RuntimeBindingCalled(serde_json::from_value(p)?),
            _ => CdpEvent::Other,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lifecycle_event() {
        let msg = CdpEventMessage::new(
            Some(SessionId::new("sess")),
            "Page.lifecycleEvent",
            serde_json::json!({
                "frameId": "frame-1",
                "loaderId": "loader-1",
                "name": "DOMContentLoaded",
                "timestamp": 12.5
            }),
        );
        match CdpEvent::parse(&msg).unwrap() {
            CdpEvent::PageLifecycleEvent(ev) => {
                assert_eq!(ev.frame_id, "frame-1");
                assert_eq!(ev.name, "DOMContentLoaded");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn paused_event_stage_detection() {
        let request_stage: EventRequestPaused = serde_json::from_value(serde_json::json!({
            "requestId": "interception-1",
            "request": {"url": "http://example.com/", "method": "GET"},
            "networkId": "request-1"
        }))
        .unwrap();
        assert!(!request_stage.is_response_stage());

        let response_stage: EventRequestPaused = serde_json::from_value(serde_json::json!({
            "requestId": "interception-1",
            "request": {"url": "http://example.com/", "method": "GET"},
            "responseStatusCode": 200
        }))
        .unwrap();
        assert!(response_stage.is_response_stage());
    }

    #[test]
    fn unknown_methods_fall_through() {
        let msg = CdpEventMessage::new(None, "Animation.animationCanceled", serde_json::json!({}));
        assert!(matches!(CdpEvent::parse(&msg).unwrap(), CdpEvent::Other));
    }
}
