//! Parameter, result and event types for the `script` module. Remote and
//! local values travel as raw `serde_json::Value`; serialization itself is
//! CDP's job, the core only books realms, handles and channels.

use serde::{Deserialize, Serialize};

/// Where an evaluation runs: a realm directly, or the default/sandboxed
/// realm of a context.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Target {
    #[serde(rename_all = "camelCase")]
    Realm { realm: String },
    #[serde(rename_all = "camelCase")]
    Context {
        context: String,
        #[serde(default)]
        sandbox: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ResultOwnership {
    Root,
    #[default]
    None,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializationOptions {
    #[serde(default)]
    pub max_dom_depth: Option<u64>,
    #[serde(default)]
    pub max_object_depth: Option<u64>,
    #[serde(default)]
    pub include_shadow_tree: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateParams {
    pub expression: String,
    pub target: Target,
    pub await_promise: bool,
    #[serde(default)]
    pub result_ownership: ResultOwnership,
    #[serde(default)]
    pub serialization_options: SerializationOptions,
    #[serde(default)]
    pub user_activation: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFunctionParams {
    pub function_declaration: String,
    pub await_promise: bool,
    pub target: Target,
    #[serde(default)]
    pub arguments: Vec<serde_json::Value>,
    #[serde(default)]
    pub this: Option<serde_json::Value>,
    #[serde(default)]
    pub result_ownership: ResultOwnership,
    #[serde(default)]
    pub serialization_options: SerializationOptions,
    #[serde(default)]
    pub user_activation: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DisownParams {
    pub handles: Vec<String>,
    pub target: Target,
}

/// A reference to a serialized DOM node, stable across realms.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedReference {
    pub shared_id: String,
    #[serde(default)]
    pub handle: Option<String>,
}

/// A channel argument declared by a preload script or passed to
/// `script.callFunction`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelProperties {
    pub channel: String,
    #[serde(default)]
    pub serialization_options: SerializationOptions,
    #[serde(default)]
    pub ownership: ResultOwnership,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ChannelValue {
    #[serde(rename_all = "camelCase")]
    Channel { value: ChannelProperties },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPreloadScriptParams {
    pub function_declaration: String,
    #[serde(default)]
    pub arguments: Vec<ChannelValue>,
    #[serde(default)]
    pub contexts: Option<Vec<String>>,
    #[serde(default)]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddPreloadScriptResult {
    pub script: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePreloadScriptParams {
    pub script: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RealmType {
    Window,
    DedicatedWorker,
    SharedWorker,
    ServiceWorker,
    Worker,
    PaintWorklet,
    AudioWorklet,
    Worklet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetRealmsParams {
    #[serde(default)]
    pub context: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<RealmType>,
}

/// Realm description, used in `script.getRealms` results and realm
/// lifecycle events.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealmInfo {
    pub realm: String,
    pub origin: String,
    #[serde(rename = "type")]
    pub kind: RealmType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    pub realm: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageParams {
    pub channel: String,
    pub data: serde_json::Value,
    pub source: Source,
}

/// `script.evaluate` / `script.callFunction` outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EvaluateResult {
    #[serde(rename_all = "camelCase")]
    Success {
        result: serde_json::Value,
        realm: String,
    },
    #[serde(rename_all = "camelCase")]
    Exception {
        exception_details: serde_json::Value,
        realm: String,
    },
}
