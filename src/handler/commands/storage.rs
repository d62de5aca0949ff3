//! The `storage` command surface: cookie access partitioned by user
//! context or storage key.

use serde_json::Value;

use crate::bidi::network::BytesValue;
use crate::bidi::storage::{
    Cookie, CookieFilter, DeleteCookiesParams, GetCookiesParams, PartitionDescriptor,
    PartitionKey, SameSite, SetCookieParams,
};
use crate::error::{Error, Result};
use crate::handler::MapperCtx;

pub async fn process(ctx: &MapperCtx, method: &str, params: Value) -> Result<Value> {
    match method {
        "storage.getCookies" => get_cookies(ctx, super::parse(params)?).await,
        "storage.setCookie" => set_cookie(ctx, super::parse(params)?).await,
        "storage.deleteCookies" => delete_cookies(ctx, super::parse(params)?).await,
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}

fn resolve_partition(
    ctx: &MapperCtx,
    partition: Option<&PartitionDescriptor>,
) -> Result<PartitionKey> {
    match partition {
        None => Ok(PartitionKey {
            user_context: Some("default".to_string()),
            source_origin: None,
        }),
        Some(PartitionDescriptor::Context { context }) => {
            let context = ctx.contexts.get(context)?;
            let source_origin = url::Url::parse(&context.url)
                .ok()
                .map(|u| u.origin().ascii_serialization());
            Ok(PartitionKey {
                user_context: Some(context.user_context),
                source_origin,
            })
        }
        Some(PartitionDescriptor::StorageKey {
            user_context,
            source_origin,
        }) => Ok(PartitionKey {
            user_context: Some(
                user_context
                    .clone()
                    .unwrap_or_else(|| "default".to_string()),
            ),
            source_origin: source_origin.clone(),
        }),
    }
}

fn browser_context_arg(partition: &PartitionKey) -> Value {
    match partition.user_context.as_deref() {
        Some("default") | None => serde_json::json!({}),
        Some(user_context) => serde_json::json!({"browserContextId": user_context}),
    }
}

fn same_site_from_cdp(raw: Option<&str>) -> SameSite {
    match raw {
        Some("Strict") => SameSite::Strict,
        Some("Lax") => SameSite::Lax,
        _ => SameSite::None,
    }
}

fn same_site_to_cdp(same_site: SameSite) -> &'static str {
    match same_site {
        SameSite::Strict => "Strict",
        SameSite::Lax => "Lax",
        SameSite::None => "None",
    }
}

fn cookie_from_cdp(raw: &Value) -> Option<Cookie> {
    let expiry = raw["expires"].as_f64().filter(|e| *e > 0.0).map(|e| e as i64);
    Some(Cookie {
        name: raw["name"].as_str()?.to_string(),
        value: BytesValue::string(raw["value"].as_str().unwrap_or_default()),
        domain: raw["domain"].as_str().unwrap_or_default().to_string(),
        path: raw["path"].as_str().unwrap_or("/").to_string(),
        size: raw["size"].as_u64(),
        http_only: raw["httpOnly"].as_bool().unwrap_or(false),
        secure: raw["secure"].as_bool().unwrap_or(false),
        same_site: same_site_from_cdp(raw["sameSite"].as_str()),
        expiry,
    })
}

fn bytes_value(value: &BytesValue) -> &str {
    let (BytesValue::String { value } | BytesValue::Base64 { value }) = value;
    value
}

fn matches_filter(cookie: &Cookie, filter: &CookieFilter) -> bool {
    if let Some(name) = &filter.name {
        if cookie.name != *name {
            return false;
        }
    }
    if let Some(value) = &filter.value {
        if bytes_value(&cookie.value) != bytes_value(value) {
            return false;
        }
    }
    if let Some(domain) = &filter.domain {
        if cookie.domain != *domain {
            return false;
        }
    }
    if let Some(path) = &filter.path {
        if cookie.path != *path {
            return false;
        }
    }
    if let Some(http_only) = filter.http_only {
        if cookie.http_only != http_only {
            return false;
        }
    }
    if let Some(secure) = filter.secure {
        if cookie.secure != secure {
            return false;
        }
    }
    if let Some(same_site) = filter.same_site {
        if cookie.same_site != same_site {
            return false;
        }
    }
    if let Some(expiry) = filter.expiry {
        if cookie.expiry != Some(expiry) {
            return false;
        }
    }
    true
}

async fn fetch_cookies(
    ctx: &MapperCtx,
    partition: &PartitionKey,
    filter: Option<&CookieFilter>,
) -> Result<Vec<Cookie>> {
    let result = ctx
        .root
        .send("Storage.getCookies", browser_context_arg(partition))
        .await?;
    let cookies = result
        .get("cookies")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    Ok(cookies
        .iter()
        .filter_map(cookie_from_cdp)
        .filter(|cookie| filter.map_or(true, |f| matches_filter(cookie, f)))
        .collect())
}

async fn get_cookies(ctx: &MapperCtx, params: GetCookiesParams) -> Result<Value> {
    let partition = resolve_partition(ctx, params.partition.as_ref())?;
    let cookies = fetch_cookies(ctx, &partition, params.filter.as_ref()).await?;
    Ok(serde_json::json!({
        "cookies": cookies,
        "partitionKey": partition,
    }))
}

async fn set_cookie(ctx: &MapperCtx, params: SetCookieParams) -> Result<Value> {
    let partition = resolve_partition(ctx, params.partition.as_ref())?;
    let cookie = &params.cookie;
    let mut raw = serde_json::json!({
        "name": cookie.name,
        "value": bytes_value(&cookie.value),
        "domain": cookie.domain,
        "path": cookie.path.clone().unwrap_or_else(|| "/".to_string()),
        "httpOnly": cookie.http_only.unwrap_or(false),
        "secure": cookie.secure.unwrap_or(false),
    });
    if let Some(same_site) = cookie.same_site {
        raw["sameSite"] = serde_json::json!(same_site_to_cdp(same_site));
    }
    if let Some(expiry) = cookie.expiry {
        raw["expires"] = serde_json::json!(expiry);
    }
    let mut args = serde_json::json!({"cookies": [raw]});
    if let Some(Value::String(id)) = browser_context_arg(&partition).get("browserContextId") {
        args["browserContextId"] = serde_json::json!(id);
    }
    ctx.root
        .send("Storage.setCookies", args)
        .await
        .map_err(|err| match err.protocol_message() {
            Some(message) => Error::invalid_argument(format!("cannot set cookie: {message}")),
            None => Error::from(err),
        })?;
    Ok(serde_json::json!({"partitionKey": partition}))
}

async fn delete_cookies(ctx: &MapperCtx, params: DeleteCookiesParams) -> Result<Value> {
    let partition = resolve_partition(ctx, params.partition.as_ref())?;
    let matched = fetch_cookies(ctx, &partition, params.filter.as_ref()).await?;
    for cookie in matched {
        ctx.root
            .send(
                "Network.deleteCookies",
                serde_json::json!({
                    "name": cookie.name,
                    "domain": cookie.domain,
                    "path": cookie.path,
                }),
            )
            .await?;
    }
    Ok(serde_json::json!({"partitionKey": partition}))
}
