//! The `goog:cdp` passthrough commands: raw protocol access for clients
//! that need it, mirrored by the `goog:cdp.<Event>` event passthrough.

use serde::Deserialize;
use serde_json::Value;

use crate::cdp::SessionId;
use crate::error::{Error, Result};
use crate::handler::MapperCtx;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendCommandParams {
    method: String,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    session: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetSessionParams {
    context: String,
}

pub async fn process(ctx: &MapperCtx, method: &str, params: Value) -> Result<Value> {
    match method {
        "goog:cdp.sendCommand" => {
            let params: SendCommandParams = super::parse(params)?;
            let session = match &params.session {
                Some(id) => ctx.root.sibling(SessionId::new(id.clone())),
                None => ctx.root.clone(),
            };
            let result = session.send(&params.method, params.params).await?;
            Ok(serde_json::json!({
                "result": result,
                "session": params.session,
            }))
        }
        "goog:cdp.getSession" => {
            let params: GetSessionParams = super::parse(params)?;
            let context = ctx.contexts.get(&params.context)?;
            Ok(serde_json::json!({
                "session": context.cdp_target.session_id().inner(),
            }))
        }
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}
