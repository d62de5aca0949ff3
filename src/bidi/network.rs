//! Parameter, result and event types for the `network` module.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum InterceptPhase {
    BeforeRequestSent,
    ResponseStarted,
    AuthRequired,
}

/// Either a literal URL string or a structured pattern. Matching semantics
/// live in `handler::network::pattern`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UrlPattern {
    #[serde(rename_all = "camelCase")]
    String { pattern: String },
    #[serde(rename_all = "camelCase")]
    Pattern {
        #[serde(default)]
        protocol: Option<String>,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        port: Option<String>,
        #[serde(default)]
        pathname: Option<String>,
        #[serde(default)]
        search: Option<String>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddInterceptParams {
    pub phases: Vec<InterceptPhase>,
    #[serde(default)]
    pub contexts: Option<Vec<String>>,
    #[serde(default)]
    pub url_patterns: Vec<UrlPattern>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddInterceptResult {
    pub intercept: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveInterceptParams {
    pub intercept: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BytesValue {
    #[serde(rename_all = "camelCase")]
    String { value: String },
    #[serde(rename_all = "camelCase")]
    Base64 { value: String },
}

impl BytesValue {
    pub fn string(value: impl Into<String>) -> Self {
        BytesValue::String {
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Header {
    pub name: String,
    pub value: BytesValue,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthCredentials {
    #[serde(rename = "type")]
    pub kind: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueRequestParams {
    pub request: String,
    #[serde(default)]
    pub body: Option<BytesValue>,
    #[serde(default)]
    pub cookies: Option<Vec<Header>>,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueResponseParams {
    pub request: String,
    #[serde(default)]
    pub cookies: Option<Vec<Header>>,
    #[serde(default)]
    pub credentials: Option<AuthCredentials>,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
    #[serde(default)]
    pub reason_phrase: Option<String>,
    #[serde(default)]
    pub status_code: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContinueWithAuthAction {
    Default,
    Cancel,
    ProvideCredentials,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinueWithAuthParams {
    pub request: String,
    pub action: ContinueWithAuthAction,
    #[serde(default)]
    pub credentials: Option<AuthCredentials>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailRequestParams {
    pub request: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvideResponseParams {
    pub request: String,
    #[serde(default)]
    pub body: Option<BytesValue>,
    #[serde(default)]
    pub cookies: Option<Vec<Header>>,
    #[serde(default)]
    pub headers: Option<Vec<Header>>,
    #[serde(default)]
    pub reason_phrase: Option<String>,
    #[serde(default)]
    pub status_code: Option<u64>,
}

/// Timing data carried on every request; populated from CDP when present,
/// zeroed otherwise.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTimingInfo {
    pub time_origin: f64,
    pub request_time: f64,
    pub redirect_start: f64,
    pub redirect_end: f64,
    pub fetch_start: f64,
    pub dns_start: f64,
    pub dns_end: f64,
    pub connect_start: f64,
    pub connect_end: f64,
    pub tls_start: f64,
    pub request_start: f64,
    pub response_start: f64,
    pub response_end: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestData {
    pub request: String,
    pub url: String,
    pub method: String,
    pub headers: Vec<Header>,
    pub cookies: Vec<serde_json::Value>,
    pub headers_size: u64,
    pub body_size: Option<u64>,
    pub timings: FetchTimingInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseContent {
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseData {
    pub url: String,
    pub protocol: String,
    pub status: u64,
    pub status_text: String,
    pub from_cache: bool,
    pub headers: Vec<Header>,
    pub mime_type: String,
    pub bytes_received: u64,
    pub headers_size: Option<u64>,
    pub body_size: Option<u64>,
    pub content: ResponseContent,
}

/// Fields common to every network event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseParameters {
    pub context: Option<String>,
    pub is_blocked: bool,
    pub navigation: Option<String>,
    pub redirect_count: u64,
    pub request: RequestData,
    pub timestamp: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intercepts: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Initiator {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeforeRequestSentParams {
    #[serde(flatten)]
    pub base: BaseParameters,
    pub initiator: Initiator,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseStartedParams {
    #[serde(flatten)]
    pub base: BaseParameters,
    pub response: ResponseData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequiredParams {
    #[serde(flatten)]
    pub base: BaseParameters,
    pub response: ResponseData,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchErrorParams {
    #[serde(flatten)]
    pub base: BaseParameters,
    pub error_text: String,
}
