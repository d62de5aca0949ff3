//! `session.subscribe` / `session.unsubscribe`.

use serde_json::Value;

use crate::bidi::session::SubscriptionRequest;
use crate::error::{Error, Result};
use crate::handler::subscription::ChannelTag;
use crate::handler::MapperCtx;

pub async fn process(
    ctx: &MapperCtx,
    method: &str,
    channel: &ChannelTag,
    params: Value,
) -> Result<Value> {
    match method {
        "session.subscribe" => subscribe(ctx, channel, super::parse(params)?),
        "session.unsubscribe" => unsubscribe(ctx, channel, super::parse(params)?),
        "session.status" => Ok(serde_json::json!({"ready": false, "message": "already connected"})),
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}

fn subscribe(ctx: &MapperCtx, channel: &ChannelTag, request: SubscriptionRequest) -> Result<Value> {
    if request.events.is_empty() {
        return Err(Error::invalid_argument("events must not be empty"));
    }
    // subscriptions key on top-level contexts; nested ids redirect upward
    let contexts: Vec<Option<String>> = match &request.contexts {
        None => vec![None],
        Some(ids) if ids.is_empty() => {
            return Err(Error::invalid_argument("contexts must not be empty"));
        }
        Some(ids) => {
            let mut resolved = Vec::with_capacity(ids.len());
            for id in ids {
                ctx.contexts.get(id)?;
                resolved.push(Some(ctx.contexts.top_level_id(id)?));
            }
            resolved
        }
    };
    for event in &request.events {
        for context in &contexts {
            ctx.subscriptions
                .subscribe(event, context.as_deref(), channel)?;
        }
    }
    Ok(serde_json::json!({}))
}

fn unsubscribe(
    ctx: &MapperCtx,
    channel: &ChannelTag,
    request: SubscriptionRequest,
) -> Result<Value> {
    if request.events.is_empty() {
        return Err(Error::invalid_argument("events must not be empty"));
    }
    let resolved: Vec<Option<String>> = match &request.contexts {
        None => vec![None],
        Some(ids) if ids.is_empty() => {
            return Err(Error::invalid_argument("contexts must not be empty"));
        }
        Some(ids) => ids
            .iter()
            // an unknown context simply has no subscription to match
            .map(|id| Some(ctx.contexts.top_level_id(id).unwrap_or_else(|_| id.clone())))
            .collect(),
    };
    let contexts: Vec<Option<&str>> = resolved.iter().map(|c| c.as_deref()).collect();
    ctx.subscriptions
        .unsubscribe_all(&request.events, &contexts, channel)?;
    Ok(serde_json::json!({}))
}
