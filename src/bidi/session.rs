//! Parameter types for the `session` module.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub events: Vec<String>,
    #[serde(default)]
    pub contexts: Option<Vec<String>>,
}
