//! The `input` command surface. `performActions` runs through a per
//! top-level-context queue: a second call on the same context waits for the
//! first to drain.

use serde_json::Value;

use crate::bidi::input::{PerformActionsParams, ReleaseActionsParams, SetFilesParams};
use crate::error::{Error, Result};
use crate::handler::input::dispatcher::{backend_node_id, ActionDispatcher};
use crate::handler::{MapperCtx, Platform};

pub async fn process(ctx: &MapperCtx, method: &str, params: Value) -> Result<Value> {
    match method {
        "input.performActions" => perform_actions(ctx, super::parse(params)?).await,
        "input.releaseActions" => release_actions(ctx, super::parse(params)?).await,
        "input.setFiles" => set_files(ctx, super::parse(params)?).await,
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}

fn dispatcher_for(ctx: &MapperCtx, context_id: &str) -> Result<(ActionDispatcher, String)> {
    let context = ctx.contexts.get(context_id)?;
    let top_level_id = ctx.contexts.top_level_id(context_id)?;
    let top_level = ctx.contexts.get(&top_level_id)?;
    let input = ctx.input.get(&top_level_id);
    let dispatcher = ActionDispatcher::new(
        context.id.clone(),
        top_level.cdp_target.session(),
        context.cdp_target.session(),
        ctx.contexts.clone(),
        input,
        ctx.config.platform == Platform::Mac,
    );
    Ok((dispatcher, top_level_id))
}

async fn perform_actions(ctx: &MapperCtx, params: PerformActionsParams) -> Result<Value> {
    let (dispatcher, top_level_id) = dispatcher_for(ctx, &params.context)?;
    let top_level = ctx.contexts.get(&top_level_id)?;
    top_level.cdp_target.unblocked().await?;

    let queue = ctx.input.get(&top_level_id).queue;
    let _guard = queue.acquire().await;
    dispatcher.dispatch(&params.actions).await?;
    Ok(serde_json::json!({}))
}

async fn release_actions(ctx: &MapperCtx, params: ReleaseActionsParams) -> Result<Value> {
    let (dispatcher, top_level_id) = dispatcher_for(ctx, &params.context)?;
    let queue = ctx.input.get(&top_level_id).queue;
    {
        let _guard = queue.acquire().await;
        dispatcher.release().await?;
    }
    ctx.input.delete(&top_level_id);
    Ok(serde_json::json!({}))
}

async fn set_files(ctx: &MapperCtx, params: SetFilesParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    context.cdp_target.unblocked().await?;
    let node_id = backend_node_id(&params.element.shared_id)
        .map_err(|_| Error::NoSuchElement(format!(
            "cannot resolve element {:?}",
            params.element.shared_id
        )))?;
    context
        .cdp_target
        .session()
        .send(
            "DOM.setFileInputFiles",
            serde_json::json!({"files": params.files, "backendNodeId": node_id}),
        )
        .await
        .map_err(|err| Error::NoSuchElement(format!("cannot set files: {err}")))?;
    Ok(serde_json::json!({}))
}
