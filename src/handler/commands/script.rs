//! The `script` command surface: evaluation, function calls, handle
//! management, preload scripts and realm listing. Value serialization is
//! delegated to CDP's deep serialization; the processor only translates
//! between the two shapes.

use serde_json::Value;

use crate::bidi::script::{
    AddPreloadScriptParams, CallFunctionParams, ChannelValue, DisownParams, EvaluateParams,
    EvaluateResult, GetRealmsParams, RemovePreloadScriptParams, ResultOwnership,
    SerializationOptions, Target,
};
use crate::cdp::CdpSession;
use crate::error::{Error, Result};
use crate::handler::input::dispatcher::backend_node_id;
use crate::handler::preload::{ChannelProxy, PreloadScript};
use crate::handler::realm::Realm;
use crate::handler::MapperCtx;

pub async fn process(ctx: &MapperCtx, method: &str, params: Value) -> Result<Value> {
    match method {
        "script.evaluate" => evaluate(ctx, super::parse(params)?).await,
        "script.callFunction" => call_function(ctx, super::parse(params)?).await,
        "script.disown" => disown(ctx, super::parse(params)?).await,
        "script.addPreloadScript" => add_preload_script(ctx, super::parse(params)?).await,
        "script.removePreloadScript" => remove_preload_script(ctx, super::parse(params)?).await,
        "script.getRealms" => get_realms(ctx, super::parse(params)?),
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}

/// Resolve the realm an evaluation targets, waiting out target
/// initialization for context targets.
async fn resolve_realm(ctx: &MapperCtx, target: &Target) -> Result<Realm> {
    match target {
        Target::Realm { realm } => ctx.realms.get(realm),
        Target::Context { context, sandbox } => {
            let context = ctx.contexts.get(context)?;
            context.cdp_target.unblocked().await?;
            ctx.realms.find_for_context(&context.id, sandbox.as_deref())
        }
    }
}

fn realm_session(ctx: &MapperCtx, realm: &Realm) -> CdpSession {
    ctx.root.sibling(realm.session_id.clone())
}

fn serialization_params(options: &SerializationOptions) -> Value {
    let mut params = serde_json::json!({"serialization": "deep"});
    if let Some(depth) = options.max_object_depth {
        params["maxDepth"] = serde_json::json!(depth);
    }
    let mut additional = serde_json::Map::new();
    if let Some(depth) = options.max_dom_depth {
        additional.insert("maxNodeDepth".into(), serde_json::json!(depth));
    }
    if let Some(mode) = &options.include_shadow_tree {
        additional.insert("includeShadowTree".into(), serde_json::json!(mode));
    }
    if !additional.is_empty() {
        params["additionalParameters"] = Value::Object(additional);
    }
    params
}

/// Shape a CDP evaluation response into the BiDi result, registering the
/// handle when the client asked for root ownership.
fn shape_result(
    ctx: &MapperCtx,
    realm: &Realm,
    ownership: ResultOwnership,
    response: Value,
) -> Result<Value> {
    if let Some(details) = response.get("exceptionDetails") {
        let exception = details
            .get("exception")
            .and_then(|e| e.get("deepSerializedValue"))
            .cloned()
            .unwrap_or(Value::Null);
        let result = EvaluateResult::Exception {
            exception_details: serde_json::json!({
                "columnNumber": details.get("columnNumber").cloned().unwrap_or(Value::Null),
                "lineNumber": details.get("lineNumber").cloned().unwrap_or(Value::Null),
                "text": details.get("text").cloned().unwrap_or(Value::Null),
                "exception": exception,
                "stackTrace": details.get("stackTrace").cloned().unwrap_or(Value::Null),
            }),
            realm: realm.id.clone(),
        };
        return serde_json::to_value(result).map_err(Error::from);
    }

    let remote = response.get("result").cloned().unwrap_or_default();
    let mut value = remote
        .get("deepSerializedValue")
        .cloned()
        .unwrap_or(Value::Null);
    if ownership == ResultOwnership::Root {
        if let Some(object_id) = remote.get("objectId").and_then(|v| v.as_str()) {
            value["handle"] = serde_json::json!(object_id);
            ctx.realms.add_handle(&realm.id, object_id);
        }
    }
    let result = EvaluateResult::Success {
        result: value,
        realm: realm.id.clone(),
    };
    serde_json::to_value(result).map_err(Error::from)
}

async fn evaluate(ctx: &MapperCtx, params: EvaluateParams) -> Result<Value> {
    let realm = resolve_realm(ctx, &params.target).await?;
    let response = realm_session(ctx, &realm)
        .send(
            "Runtime.evaluate",
            serde_json::json!({
                "expression": params.expression,
                "contextId": realm.execution_context_id,
                "awaitPromise": params.await_promise,
                "serializationOptions": serialization_params(&params.serialization_options),
                "userGesture": params.user_activation,
            }),
        )
        .await?;
    shape_result(ctx, &realm, params.result_ownership, response)
}

/// One BiDi local value turned into a CDP call argument.
async fn call_argument(
    ctx: &MapperCtx,
    realm: &Realm,
    session: &CdpSession,
    value: &Value,
) -> Result<Value> {
    let kind = value.get("type").and_then(|v| v.as_str());
    if let Some(handle) = value.get("handle").and_then(|v| v.as_str()) {
        return Ok(serde_json::json!({"objectId": handle}));
    }
    if let Some(shared_id) = value.get("sharedId").and_then(|v| v.as_str()) {
        let node = session
            .send(
                "DOM.resolveNode",
                serde_json::json!({
                    "backendNodeId": backend_node_id(shared_id)?,
                    "executionContextId": realm.execution_context_id,
                }),
            )
            .await
            .map_err(|err| Error::NoSuchNode(format!("cannot resolve node: {err}")))?;
        let object_id = node["object"]["objectId"]
            .as_str()
            .ok_or_else(|| Error::NoSuchNode(format!("unresolvable shared id {shared_id:?}")))?;
        return Ok(serde_json::json!({"objectId": object_id}));
    }
    match kind {
        Some("channel") => {
            let channel: ChannelValue = serde_json::from_value(value.clone())
                .map_err(|err| Error::invalid_argument(format!("malformed channel: {err}")))?;
            let ChannelValue::Channel { value: properties } = channel;
            let proxy = ChannelProxy::new(properties);
            session
                .send(
                    "Runtime.addBinding",
                    serde_json::json!({"name": proxy.binding}),
                )
                .await?;
            let wrapper = session
                .send(
                    "Runtime.evaluate",
                    serde_json::json!({
                        "expression": proxy.wrapper_expression(),
                        "contextId": realm.execution_context_id,
                    }),
                )
                .await?;
            let object_id = wrapper["result"]["objectId"]
                .as_str()
                .ok_or_else(|| Error::unknown("channel wrapper produced no object"))?
                .to_string();
            ctx.preload.register_channel(&proxy);
            Ok(serde_json::json!({"objectId": object_id}))
        }
        // special numbers have no JSON spelling and travel as
        // unserializable values
        Some("number") if value.get("value").map_or(false, Value::is_string) => {
            match value["value"].as_str().unwrap_or_default() {
                special @ ("NaN" | "Infinity" | "-Infinity" | "-0") => {
                    Ok(serde_json::json!({"unserializableValue": special}))
                }
                other => Err(Error::invalid_argument(format!(
                    "invalid special number {other:?}"
                ))),
            }
        }
        Some(_) => Ok(serde_json::json!({"value": plain_value(value)?})),
        None => Err(Error::invalid_argument("argument without type")),
    }
}

/// Primitive and plain composite local values translate into plain JSON;
/// anything needing identity has to come in as a handle or shared id.
fn plain_value(value: &Value) -> Result<Value> {
    let kind = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let inner = value.get("value");
    match kind {
        "undefined" | "null" => Ok(Value::Null),
        "string" | "boolean" => Ok(inner.cloned().unwrap_or(Value::Null)),
        "number" => match inner {
            Some(Value::String(special)) => match special.as_str() {
                "NaN" | "Infinity" | "-Infinity" | "-0" => Ok(Value::Null),
                other => Err(Error::invalid_argument(format!(
                    "invalid special number {other:?}"
                ))),
            },
            Some(number) => Ok(number.clone()),
            None => Ok(Value::Null),
        },
        "array" => {
            let items = inner.and_then(|v| v.as_array()).cloned().unwrap_or_default();
            let mut out = Vec::with_capacity(items.len());
            for item in &items {
                out.push(plain_value(item)?);
            }
            Ok(Value::Array(out))
        }
        "object" => {
            let entries = inner.and_then(|v| v.as_array()).cloned().unwrap_or_default();
            let mut out = serde_json::Map::new();
            for entry in &entries {
                let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                    Error::invalid_argument("object entries must be [key, value] pairs")
                })?;
                let key = match &pair[0] {
                    Value::String(key) => key.clone(),
                    other => plain_value(other)?
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| Error::invalid_argument("non-string object key"))?,
                };
                out.insert(key, plain_value(&pair[1])?);
            }
            Ok(Value::Object(out))
        }
        other => Err(Error::invalid_argument(format!(
            "unsupported local value type {other:?}"
        ))),
    }
}

async fn call_function(ctx: &MapperCtx, params: CallFunctionParams) -> Result<Value> {
    let realm = resolve_realm(ctx, &params.target).await?;
    let session = realm_session(ctx, &realm);

    let mut arguments = Vec::with_capacity(params.arguments.len() + 1);
    if let Some(this) = &params.this {
        arguments.push(call_argument(ctx, &realm, &session, this).await?);
    }
    for argument in &params.arguments {
        arguments.push(call_argument(ctx, &realm, &session, argument).await?);
    }

    // `this` travels as the first argument of the trampoline
    let declaration = if params.this.is_some() {
        format!(
            "function(...args) {{ return ({}).apply(args[0], args.slice(1)); }}",
            params.function_declaration
        )
    } else {
        format!(
            "function(...args) {{ return ({}).apply(undefined, args); }}",
            params.function_declaration
        )
    };

    let response = session
        .send(
            "Runtime.callFunctionOn",
            serde_json::json!({
                "functionDeclaration": declaration,
                "arguments": arguments,
                "executionContextId": realm.execution_context_id,
                "awaitPromise": params.await_promise,
                "serializationOptions": serialization_params(&params.serialization_options),
                "userGesture": params.user_activation,
            }),
        )
        .await?;
    shape_result(ctx, &realm, params.result_ownership, response)
}

async fn disown(ctx: &MapperCtx, params: DisownParams) -> Result<Value> {
    let realm = resolve_realm(ctx, &params.target).await?;
    let session = realm_session(ctx, &realm);
    for handle in &params.handles {
        let result = session
            .send(
                "Runtime.releaseObject",
                serde_json::json!({"objectId": handle}),
            )
            .await;
        if let Err(err) = result {
            if !err.is_session_gone() {
                tracing::debug!("releaseObject failed for {handle}: {err}");
            }
        }
        ctx.realms.remove_handle(&realm.id, handle);
    }
    Ok(serde_json::json!({}))
}

async fn add_preload_script(ctx: &MapperCtx, params: AddPreloadScriptParams) -> Result<Value> {
    if let Some(contexts) = &params.contexts {
        if contexts.is_empty() {
            return Err(Error::invalid_argument("contexts must not be empty"));
        }
        for id in contexts {
            let context = ctx.contexts.get(id)?;
            if !context.is_top_level() {
                return Err(Error::invalid_argument(format!(
                    "context {id} is not top-level"
                )));
            }
        }
    }
    let channels = params
        .arguments
        .into_iter()
        .map(|ChannelValue::Channel { value }| value)
        .collect();
    let script = PreloadScript::new(
        params.function_declaration,
        params.sandbox,
        params.contexts,
        channels,
    );
    let source = script.source();
    let channel_bindings: Vec<String> =
        script.channels.iter().map(|c| c.binding.clone()).collect();
    let sandbox = script.sandbox.clone();
    let script_id = ctx.preload.add(script);

    // install on every already-attached matching target; future targets
    // pick the script up during unblock
    for context in ctx.contexts.top_level() {
        if !ctx
            .preload
            .scripts_for(&context.id)
            .iter()
            .any(|s| s.id == script_id)
        {
            continue;
        }
        let session = context.cdp_target.session();
        for binding in &channel_bindings {
            session
                .send("Runtime.addBinding", serde_json::json!({"name": binding}))
                .await?;
        }
        let mut args = serde_json::json!({"source": source});
        if let Some(sandbox) = &sandbox {
            args["worldName"] = serde_json::json!(sandbox);
        }
        let result = session
            .send("Page.addScriptToEvaluateOnNewDocument", args)
            .await?;
        if let Some(cdp_id) = result.get("identifier").and_then(|v| v.as_str()) {
            ctx.preload.record_cdp_id(
                &script_id,
                context.cdp_target.target_id().clone(),
                cdp_id.to_string(),
            );
        }
    }
    Ok(serde_json::json!({"script": script_id}))
}

async fn remove_preload_script(
    ctx: &MapperCtx,
    params: RemovePreloadScriptParams,
) -> Result<Value> {
    let script = ctx.preload.remove(&params.script)?;
    for (target_id, cdp_id) in &script.cdp_ids {
        let session = ctx
            .contexts
            .all()
            .into_iter()
            .find(|c| c.cdp_target.target_id() == target_id)
            .map(|c| c.cdp_target.session());
        if let Some(session) = session {
            let result = session
                .send(
                    "Page.removeScriptToEvaluateOnNewDocument",
                    serde_json::json!({"identifier": cdp_id}),
                )
                .await;
            if let Err(err) = result {
                if !err.is_session_gone() {
                    tracing::debug!("failed to uninstall preload script: {err}");
                }
            }
        }
    }
    Ok(serde_json::json!({}))
}

fn get_realms(ctx: &MapperCtx, params: GetRealmsParams) -> Result<Value> {
    if let Some(context) = &params.context {
        ctx.contexts.get(context)?;
    }
    let realms = ctx.realms.list(params.context.as_deref(), params.kind);
    Ok(serde_json::json!({"realms": realms}))
}

/// Shape a JSON payload (a channel message) as a BiDi remote value.
pub(crate) fn remote_value_from_json(value: &Value) -> Value {
    match value {
        Value::Null => serde_json::json!({"type": "null"}),
        Value::Bool(b) => serde_json::json!({"type": "boolean", "value": b}),
        Value::Number(n) => serde_json::json!({"type": "number", "value": n}),
        Value::String(s) => serde_json::json!({"type": "string", "value": s}),
        Value::Array(items) => serde_json::json!({
            "type": "array",
            "value": items.iter().map(remote_value_from_json).collect::<Vec<_>>(),
        }),
        Value::Object(map) => serde_json::json!({
            "type": "object",
            "value": map
                .iter()
                .map(|(k, v)| serde_json::json!([k, remote_value_from_json(v)]))
                .collect::<Vec<_>>(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_values_translate() {
        assert_eq!(
            plain_value(&serde_json::json!({"type": "string", "value": "hi"})).unwrap(),
            serde_json::json!("hi")
        );
        assert_eq!(
            plain_value(&serde_json::json!({"type": "number", "value": 4.5})).unwrap(),
            serde_json::json!(4.5)
        );
        assert_eq!(
            plain_value(&serde_json::json!({
                "type": "array",
                "value": [{"type": "boolean", "value": true}]
            }))
            .unwrap(),
            serde_json::json!([true])
        );
        assert_eq!(
            plain_value(&serde_json::json!({
                "type": "object",
                "value": [["key", {"type": "string", "value": "v"}]]
            }))
            .unwrap(),
            serde_json::json!({"key": "v"})
        );
        assert!(plain_value(&serde_json::json!({"type": "map", "value": []})).is_err());
    }

    #[test]
    fn channel_payload_round_trips_as_remote_value() {
        let payload = serde_json::json!({"items": [1, "two"], "ok": true});
        let remote = remote_value_from_json(&payload);
        assert_eq!(remote["type"], "object");
        let entries = remote["value"].as_array().unwrap();
        assert_eq!(entries.len(), 2);
    }
}
