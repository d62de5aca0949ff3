//! The `network` command surface: intercept management and blocked-request
//! actions.

use serde_json::Value;

use crate::bidi::network::{
    AddInterceptParams, BytesValue, ContinueRequestParams, ContinueResponseParams,
    ContinueWithAuthAction, ContinueWithAuthParams, FailRequestParams, Header, InterceptPhase,
    ProvideResponseParams, RemoveInterceptParams,
};
use crate::error::{CdpError, Error, Result};
use crate::handler::network::NetworkRequest;
use crate::handler::MapperCtx;

pub async fn process(ctx: &MapperCtx, method: &str, params: Value) -> Result<Value> {
    match method {
        "network.addIntercept" => add_intercept(ctx, super::parse(params)?).await,
        "network.removeIntercept" => remove_intercept(ctx, super::parse(params)?).await,
        "network.continueRequest" => continue_request(ctx, super::parse(params)?).await,
        "network.continueResponse" => continue_response(ctx, super::parse(params)?).await,
        "network.continueWithAuth" => continue_with_auth(ctx, super::parse(params)?).await,
        "network.failRequest" => fail_request(ctx, super::parse(params)?).await,
        "network.provideResponse" => provide_response(ctx, super::parse(params)?).await,
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}

/// Re-sync every page target's Fetch configuration with the intercept
/// table.
async fn apply_fetch_stages(ctx: &MapperCtx) -> Result<()> {
    let stages = ctx.network.fetch_stages();
    let targets: Vec<_> = ctx
        .contexts
        .top_level()
        .into_iter()
        .map(|context| context.cdp_target)
        .collect();
    for target in targets {
        target
            .toggle_fetch_if_needed(stages, &ctx.network)
            .await
            .map_err(Error::from)?;
    }
    Ok(())
}

async fn add_intercept(ctx: &MapperCtx, params: AddInterceptParams) -> Result<Value> {
    let intercept = ctx.network.add_intercept(params)?;
    apply_fetch_stages(ctx).await?;
    Ok(serde_json::json!({"intercept": intercept}))
}

async fn remove_intercept(ctx: &MapperCtx, params: RemoveInterceptParams) -> Result<Value> {
    ctx.network.remove_intercept(&params.intercept)?;
    apply_fetch_stages(ctx).await?;
    Ok(serde_json::json!({}))
}

/// The session to address Fetch actions for a request.
fn session_for(ctx: &MapperCtx, request: &NetworkRequest) -> Result<crate::cdp::CdpSession> {
    match request.context_id() {
        Some(context_id) => Ok(ctx.contexts.get(&context_id)?.cdp_target.session()),
        None => Ok(ctx.root.clone()),
    }
}

/// CDP rejects bad header values with "Invalid header"; that is the
/// client's mistake, not an internal one.
fn map_action_error(err: CdpError) -> Error {
    match err.protocol_message() {
        Some(message) if message.contains("Invalid header") => {
            Error::invalid_argument(message.to_string())
        }
        _ => Error::from(err),
    }
}

fn header_list(headers: &[Header]) -> Value {
    let entries: Vec<Value> = headers
        .iter()
        .map(|h| {
            let (BytesValue::String { value } | BytesValue::Base64 { value }) = &h.value;
            serde_json::json!({"name": h.name, "value": value})
        })
        .collect();
    Value::Array(entries)
}

async fn continue_request(ctx: &MapperCtx, params: ContinueRequestParams) -> Result<Value> {
    let request = ctx.network.get_request(&params.request)?;
    let fetch_id = request.begin_action(
        &[InterceptPhase::BeforeRequestSent],
        "network.continueRequest",
    )?;
    let mut args = serde_json::json!({"requestId": fetch_id});
    if let Some(url) = &params.url {
        args["url"] = serde_json::json!(url);
    }
    if let Some(method) = &params.method {
        args["method"] = serde_json::json!(method);
    }
    if let Some(headers) = &params.headers {
        args["headers"] = header_list(headers);
    }
    if let Some(BytesValue::Base64 { value }) | Some(BytesValue::String { value }) = &params.body {
        args["postData"] = serde_json::json!(value);
    }
    session_for(ctx, &request)?
        .send("Fetch.continueRequest", args)
        .await
        .map_err(map_action_error)?;
    request.finish_action();
    Ok(serde_json::json!({}))
}

async fn continue_response(ctx: &MapperCtx, params: ContinueResponseParams) -> Result<Value> {
    let request = ctx.network.get_request(&params.request)?;
    let fetch_id = request.begin_action(
        &[InterceptPhase::ResponseStarted, InterceptPhase::AuthRequired],
        "network.continueResponse",
    )?;
    // always exactly one Fetch.continueResponse, modified or not
    let mut args = serde_json::json!({"requestId": fetch_id});
    if let Some(status) = params.status_code {
        args["responseCode"] = serde_json::json!(status);
    }
    if let Some(reason) = &params.reason_phrase {
        args["responsePhrase"] = serde_json::json!(reason);
    }
    if let Some(headers) = &params.headers {
        args["responseHeaders"] = header_list(headers);
    }
    session_for(ctx, &request)?
        .send("Fetch.continueResponse", args)
        .await
        .map_err(map_action_error)?;
    request.finish_action();
    Ok(serde_json::json!({}))
}

async fn continue_with_auth(ctx: &MapperCtx, params: ContinueWithAuthParams) -> Result<Value> {
    let request = ctx.network.get_request(&params.request)?;
    let fetch_id = request.begin_action(
        &[InterceptPhase::AuthRequired],
        "network.continueWithAuth",
    )?;
    let mut challenge = serde_json::json!({
        "response": match params.action {
            ContinueWithAuthAction::ProvideCredentials => "ProvideCredentials",
            ContinueWithAuthAction::Cancel => "CancelAuth",
            ContinueWithAuthAction::Default => "Default",
        },
    });
    if params.action == ContinueWithAuthAction::ProvideCredentials {
        let credentials = params.credentials.as_ref().ok_or_else(|| {
            Error::invalid_argument("provideCredentials requires credentials")
        })?;
        challenge["username"] = serde_json::json!(credentials.username);
        challenge["password"] = serde_json::json!(credentials.password);
    }
    session_for(ctx, &request)?
        .send(
            "Fetch.continueWithAuth",
            serde_json::json!({
                "requestId": fetch_id,
                "authChallengeResponse": challenge,
            }),
        )
        .await
        .map_err(map_action_error)?;
    request.finish_action();
    Ok(serde_json::json!({}))
}

async fn fail_request(ctx: &MapperCtx, params: FailRequestParams) -> Result<Value> {
    let request = ctx.network.get_request(&params.request)?;
    let fetch_id = request.begin_action(
        &[
            InterceptPhase::BeforeRequestSent,
            InterceptPhase::ResponseStarted,
        ],
        "network.failRequest",
    )?;
    session_for(ctx, &request)?
        .send(
            "Fetch.failRequest",
            serde_json::json!({"requestId": fetch_id, "errorReason": "Failed"}),
        )
        .await
        .map_err(map_action_error)?;
    request.finish_action();
    Ok(serde_json::json!({}))
}

async fn provide_response(ctx: &MapperCtx, params: ProvideResponseParams) -> Result<Value> {
    let request = ctx.network.get_request(&params.request)?;
    let fetch_id = request.begin_action(
        &[
            InterceptPhase::BeforeRequestSent,
            InterceptPhase::ResponseStarted,
            InterceptPhase::AuthRequired,
        ],
        "network.provideResponse",
    )?;
    let mut args = serde_json::json!({
        "requestId": fetch_id,
        "responseCode": params.status_code.unwrap_or(200),
    });
    if let Some(reason) = &params.reason_phrase {
        args["responsePhrase"] = serde_json::json!(reason);
    }
    if let Some(headers) = &params.headers {
        args["responseHeaders"] = header_list(headers);
    }
    if let Some(BytesValue::Base64 { value }) = &params.body {
        args["body"] = serde_json::json!(value);
    } else if let Some(BytesValue::String { value }) = &params.body {
        args["body"] = serde_json::json!(value);
    }
    session_for(ctx, &request)?
        .send("Fetch.fulfillRequest", args)
        .await
        .map_err(map_action_error)?;
    request.finish_action();
    Ok(serde_json::json!({}))
}
