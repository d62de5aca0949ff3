//! Parameter and result types for the `browsingContext` module.

use serde::{Deserialize, Serialize};

/// How long `browsingContext.navigate` / `reload` block before resolving.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ReadinessState {
    #[default]
    None,
    Interactive,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CreateType {
    Tab,
    Window,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParams {
    #[serde(rename = "type")]
    pub kind: CreateType,
    #[serde(default)]
    pub reference_context: Option<String>,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub user_context: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseParams {
    pub context: String,
    #[serde(default)]
    pub prompt_unload: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivateParams {
    pub context: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateParams {
    pub context: String,
    pub url: String,
    #[serde(default)]
    pub wait: ReadinessState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateResult {
    pub navigation: Option<String>,
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadParams {
    pub context: String,
    #[serde(default)]
    pub ignore_cache: bool,
    #[serde(default)]
    pub wait: ReadinessState,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraverseHistoryParams {
    pub context: String,
    pub delta: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetTreeParams {
    #[serde(default)]
    pub max_depth: Option<u64>,
    #[serde(default)]
    pub root: Option<String>,
}

/// One node of the context tree returned by `browsingContext.getTree`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Info {
    pub context: String,
    pub url: String,
    pub user_context: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub children: Option<Vec<Info>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ScreenshotOrigin {
    #[default]
    Viewport,
    Document,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageFormat {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub quality: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClipRectangle {
    #[serde(rename_all = "camelCase")]
    Box { x: f64, y: f64, width: f64, height: f64 },
    Element { element: crate::bidi::script::SharedReference },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureScreenshotParams {
    pub context: String,
    #[serde(default)]
    pub origin: ScreenshotOrigin,
    #[serde(default)]
    pub format: Option<ImageFormat>,
    #[serde(default)]
    pub clip: Option<ClipRectangle>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PrintOrientation {
    Landscape,
    Portrait,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintMarginParameters {
    #[serde(default = "default_margin")]
    pub top: f64,
    #[serde(default = "default_margin")]
    pub bottom: f64,
    #[serde(default = "default_margin")]
    pub left: f64,
    #[serde(default = "default_margin")]
    pub right: f64,
}

fn default_margin() -> f64 {
    1.0
}

impl Default for PrintMarginParameters {
    fn default() -> Self {
        Self {
            top: 1.0,
            bottom: 1.0,
            left: 1.0,
            right: 1.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintPageParameters {
    #[serde(default = "default_page_width")]
    pub width: f64,
    #[serde(default = "default_page_height")]
    pub height: f64,
}

fn default_page_width() -> f64 {
    21.59
}

fn default_page_height() -> f64 {
    27.94
}

impl Default for PrintPageParameters {
    fn default() -> Self {
        Self {
            width: 21.59,
            height: 27.94,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrintParams {
    pub context: String,
    #[serde(default)]
    pub background: bool,
    #[serde(default)]
    pub margin: PrintMarginParameters,
    #[serde(default)]
    pub orientation: Option<PrintOrientation>,
    #[serde(default)]
    pub page: PrintPageParameters,
    #[serde(default)]
    pub page_ranges: Vec<serde_json::Value>,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default = "default_true")]
    pub shrink_to_fit: bool,
}

fn default_scale() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Viewport {
    pub width: u64,
    pub height: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetViewportParams {
    pub context: String,
    #[serde(default)]
    pub viewport: Option<Viewport>,
    #[serde(default)]
    pub device_pixel_ratio: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleUserPromptParams {
    pub context: String,
    #[serde(default)]
    pub accept: Option<bool>,
    #[serde(default)]
    pub user_text: Option<String>,
}

/// Payload shared by every navigation-related event.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigationInfo {
    pub context: String,
    pub navigation: Option<String>,
    pub timestamp: u64,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPromptOpenedParams {
    pub context: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub handler: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserPromptClosedParams {
    pub context: String,
    pub accepted: bool,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_text: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadWillBeginParams {
    pub context: String,
    pub navigation: Option<String>,
    pub timestamp: u64,
    pub url: String,
    pub suggested_filename: String,
}
