//! Per-module command processors. Each processor resolves its target
//! entities through the storages and talks CDP through the owning target's
//! session; routing is a plain method-prefix dispatch.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::handler::subscription::ChannelTag;
use crate::handler::MapperCtx;

pub mod browsing_context;
pub mod cdp;
pub mod input;
pub mod network;
pub mod script;
pub mod session;
pub mod storage;

pub async fn process(
    ctx: &MapperCtx,
    method: &str,
    channel: &ChannelTag,
    params: Value,
) -> Result<Value> {
    let module = crate::bidi::module_of(method);
    match module {
        "session" => session::process(ctx, method, channel, params).await,
        "browsingContext" => browsing_context::process(ctx, method, params).await,
        "network" => network::process(ctx, method, params).await,
        "script" => script::process(ctx, method, params).await,
        "input" => input::process(ctx, method, params).await,
        "storage" => storage::process(ctx, method, params).await,
        crate::bidi::CDP_MODULE => cdp::process(ctx, method, params).await,
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}

/// Deserialize command params, mapping malformed payloads onto
/// `invalid argument`. Omitted params count as an empty object.
pub(crate) fn parse<T: serde::de::DeserializeOwned>(params: Value) -> Result<T> {
    let params = if params.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        params
    };
    serde_json::from_value(params)
        .map_err(|err| Error::invalid_argument(format!("malformed params: {err}")))
}
