//! The `browsingContext` command surface.

use serde_json::Value;

use crate::bidi::browsing_context::{
    ActivateParams, CaptureScreenshotParams, ClipRectangle, CloseParams, CreateParams, CreateType,
    GetTreeParams, HandleUserPromptParams, NavigateParams, NavigateResult, PrintParams,
    ReadinessState, ReloadParams, ScreenshotOrigin, SetViewportParams, TraverseHistoryParams,
};
use crate::error::{Error, Result};
use crate::handler::context::{BrowsingContext, ABOUT_BLANK};
use crate::handler::input::dispatcher::backend_node_id;
use crate::handler::navigation::StartedNavigation;
use crate::handler::MapperCtx;

/// Chromium refuses device metrics beyond this bound.
const MAX_VIEWPORT_DIMENSION: u64 = 10_000_000;

pub async fn process(ctx: &MapperCtx, method: &str, params: Value) -> Result<Value> {
    match method {
        "browsingContext.create" => create(ctx, super::parse(params)?).await,
        "browsingContext.close" => close(ctx, super::parse(params)?).await,
        "browsingContext.activate" => activate(ctx, super::parse(params)?).await,
        "browsingContext.navigate" => navigate(ctx, super::parse(params)?).await,
        "browsingContext.reload" => reload(ctx, super::parse(params)?).await,
        "browsingContext.traverseHistory" => traverse_history(ctx, super::parse(params)?).await,
        "browsingContext.captureScreenshot" => capture_screenshot(ctx, super::parse(params)?).await,
        "browsingContext.print" => print(ctx, super::parse(params)?).await,
        "browsingContext.setViewport" => set_viewport(ctx, super::parse(params)?).await,
        "browsingContext.handleUserPrompt" => handle_user_prompt(ctx, super::parse(params)?).await,
        "browsingContext.getTree" => get_tree(ctx, super::parse(params)?),
        _ => Err(Error::UnknownCommand(format!("unknown command: {method}"))),
    }
}

async fn create(ctx: &MapperCtx, params: CreateParams) -> Result<Value> {
    if let Some(reference) = &params.reference_context {
        let reference = ctx.contexts.get(reference)?;
        if !reference.is_top_level() {
            return Err(Error::invalid_argument(
                "referenceContext must be top-level",
            ));
        }
    }
    let mut args = serde_json::json!({
        "url": ABOUT_BLANK,
        "newWindow": params.kind == CreateType::Window,
        "background": params.background,
    });
    if let Some(user_context) = &params.user_context {
        if user_context != "default" {
            args["browserContextId"] = serde_json::json!(user_context);
        }
    }
    let result = ctx.root.send("Target.createTarget", args).await?;
    let target_id = result
        .get("targetId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::unknown("Target.createTarget returned no target id"))?
        .to_string();

    ctx.targets.wait_for_context(&target_id).await?;
    let context = ctx.contexts.get(&target_id)?;
    context.cdp_target.unblocked().await?;
    Ok(serde_json::json!({"context": target_id}))
}

async fn close(ctx: &MapperCtx, params: CloseParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    if !context.is_top_level() {
        return Err(Error::invalid_argument(
            "only top-level contexts can be closed",
        ));
    }
    if params.prompt_unload {
        // let beforeunload run; the dialog surfaces as a user prompt event
        context
            .cdp_target
            .session()
            .send("Page.close", serde_json::json!({}))
            .await?;
    } else {
        ctx.root
            .send(
                "Target.closeTarget",
                serde_json::json!({"targetId": context.cdp_target.target_id()}),
            )
            .await?;
    }
    Ok(serde_json::json!({}))
}

async fn activate(ctx: &MapperCtx, params: ActivateParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    if !context.is_top_level() {
        return Err(Error::invalid_argument(
            "only top-level contexts can be activated",
        ));
    }
    context.cdp_target.unblocked().await?;
    // Page.bringToFront does not restore a minimized window
    if let Some(window_id) = context.cdp_target.window_id() {
        let result = ctx
            .root
            .send(
                "Browser.setWindowBounds",
                serde_json::json!({
                    "windowId": window_id,
                    "bounds": {"windowState": "normal"},
                }),
            )
            .await;
        if let Err(err) = result {
            if !err.is_session_gone() {
                tracing::debug!("restoring window {window_id} failed: {err}");
            }
        }
    }
    context
        .cdp_target
        .session()
        .send("Page.bringToFront", serde_json::json!({}))
        .await?;
    Ok(serde_json::json!({}))
}

async fn navigate(ctx: &MapperCtx, params: NavigateParams) -> Result<Value> {
    url::Url::parse(&params.url)
        .map_err(|err| Error::invalid_argument(format!("malformed URL {:?}: {err}", params.url)))?;
    let context = ctx.contexts.get(&params.context)?;
    context.cdp_target.unblocked().await?;

    let tracker = context.navigation.clone();
    let started = tracker.start_client_navigation(&params.url);
    let response = context
        .cdp_target
        .session()
        .send(
            "Page.navigate",
            serde_json::json!({"url": params.url, "frameId": context.id}),
        )
        .await;

    let response = match response {
        Ok(response) => response,
        Err(err) => {
            tracker.fail_navigation(&started, &err.to_string());
            return Err(Error::unknown(format!("navigation failed: {err}")));
        }
    };
    if let Some(error_text) = response.get("errorText").and_then(|v| v.as_str()) {
        tracker.fail_navigation(&started, error_text);
        return Err(Error::unknown(format!("navigation failed: {error_text}")));
    }
    let same_document = response.get("loaderId").and_then(|v| v.as_str()).is_none();

    await_readiness(&context, &started, params.wait, same_document).await
}

async fn reload(ctx: &MapperCtx, params: ReloadParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    context.cdp_target.unblocked().await?;

    let tracker = context.navigation.clone();
    let started = tracker.start_client_navigation(tracker.url());
    if let Err(err) = context
        .cdp_target
        .session()
        .send(
            "Page.reload",
            serde_json::json!({"ignoreCache": params.ignore_cache}),
        )
        .await
    {
        tracker.fail_navigation(&started, &err.to_string());
        return Err(Error::unknown(format!("reload failed: {err}")));
    }
    await_readiness(&context, &started, params.wait, false).await
}

/// Shared wait logic of `navigate` and `reload`. A navigation canceled
/// while awaited resolves the command successfully; the tracker has already
/// announced the abort.
async fn await_readiness(
    context: &BrowsingContext,
    started: &StartedNavigation,
    wait: ReadinessState,
    same_document: bool,
) -> Result<Value> {
    let tracker = &context.navigation;
    let result = NavigateResult {
        navigation: Some(started.id.clone()),
        url: started.url.clone(),
    };
    let result = serde_json::to_value(result).map_err(Error::from)?;

    match wait {
        ReadinessState::None => Ok(result),
        ReadinessState::Interactive if same_document => {
            let _ = tracker.wait_within_document().await;
            Ok(result)
        }
        ReadinessState::Complete if same_document => {
            let _ = tracker.wait_within_document().await;
            Ok(result)
        }
        ReadinessState::Interactive => {
            let _ = tracker.wait_dom_content_loaded().await;
            Ok(result)
        }
        ReadinessState::Complete => {
            let _ = tracker.wait_load().await;
            Ok(result)
        }
    }
}

async fn traverse_history(ctx: &MapperCtx, params: TraverseHistoryParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    if !context.is_top_level() {
        return Err(Error::invalid_argument(
            "history can only be traversed on top-level contexts",
        ));
    }
    let session = context.cdp_target.session();
    let history = session
        .send("Page.getNavigationHistory", serde_json::json!({}))
        .await?;
    let current = history
        .get("currentIndex")
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    let entries = history
        .get("entries")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();
    let target = current + params.delta;
    if target < 0 || target as usize >= entries.len() {
        return Err(Error::NoSuchHistoryEntry(format!(
            "no history entry at delta {}",
            params.delta
        )));
    }
    let entry_id = entries[target as usize]
        .get("id")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| Error::unknown("history entry without id"))?;
    session
        .send(
            "Page.navigateToHistoryEntry",
            serde_json::json!({"entryId": entry_id}),
        )
        .await?;
    Ok(serde_json::json!({}))
}

async fn capture_screenshot(ctx: &MapperCtx, params: CaptureScreenshotParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    if !context.is_top_level() {
        return Err(Error::UnsupportedOperation(
            "screenshots are only supported on top-level contexts".into(),
        ));
    }
    context.cdp_target.unblocked().await?;
    let session = context.cdp_target.session();

    let metrics = session
        .send("Page.getLayoutMetrics", serde_json::json!({}))
        .await?;
    let viewport = &metrics["cssVisualViewport"];
    let page_x = viewport["pageX"].as_f64().unwrap_or(0.0);
    let page_y = viewport["pageY"].as_f64().unwrap_or(0.0);
    let viewport_rect = (
        page_x,
        page_y,
        viewport["clientWidth"].as_f64().unwrap_or(0.0),
        viewport["clientHeight"].as_f64().unwrap_or(0.0),
    );

    let base = match params.origin {
        ScreenshotOrigin::Viewport => viewport_rect,
        ScreenshotOrigin::Document => {
            let content = &metrics["cssContentSize"];
            (
                0.0,
                0.0,
                content["width"].as_f64().unwrap_or(0.0),
                content["height"].as_f64().unwrap_or(0.0),
            )
        }
    };

    let rect = match &params.clip {
        None => base,
        Some(ClipRectangle::Box {
            x,
            y,
            width,
            height,
        }) => {
            // box clips are relative to the origin rectangle
            intersect(base, (base.0 + x, base.1 + y, *width, *height))
        }
        Some(ClipRectangle::Element { element }) => {
            let node_id = backend_node_id(&element.shared_id)?;
            let model = session
                .send(
                    "DOM.getBoxModel",
                    serde_json::json!({"backendNodeId": node_id}),
                )
                .await
                .map_err(|err| {
                    Error::UnableToCaptureScreen(format!("cannot resolve clip element: {err}"))
                })?;
            let rect = content_bounds(&model["model"]["content"]).ok_or_else(|| {
                Error::UnableToCaptureScreen("clip element has no box".into())
            })?;
            intersect(base, (rect.0 + page_x, rect.1 + page_y, rect.2, rect.3))
        }
    };
    if rect.2 <= 0.0 || rect.3 <= 0.0 {
        return Err(Error::UnableToCaptureScreen(
            "clip resolves to an empty area".into(),
        ));
    }

    let format = params.format.as_ref();
    let image_format = format
        .map(|f| f.kind.trim_start_matches("image/").to_string())
        .unwrap_or_else(|| "png".to_string());
    let mut args = serde_json::json!({
        "format": image_format,
        "clip": {"x": rect.0, "y": rect.1, "width": rect.2, "height": rect.3, "scale": 1.0},
        "captureBeyondViewport": params.origin == ScreenshotOrigin::Document,
    });
    if let Some(quality) = format.and_then(|f| f.quality) {
        args["quality"] = serde_json::json!((quality * 100.0).round() as u64);
    }
    let result = session.send("Page.captureScreenshot", args).await?;
    Ok(serde_json::json!({"data": result["data"]}))
}

async fn print(ctx: &MapperCtx, params: PrintParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    if !(0.1..=2.0).contains(&params.scale) {
        return Err(Error::invalid_argument("scale must be within 0.1 and 2"));
    }
    let page_ranges = parse_page_ranges(&params.page_ranges)?;

    const CM_PER_INCH: f64 = 2.54;
    let args = serde_json::json!({
        "printBackground": params.background,
        "landscape": matches!(
            params.orientation,
            Some(crate::bidi::browsing_context::PrintOrientation::Landscape)
        ),
        "scale": params.scale,
        "paperWidth": params.page.width / CM_PER_INCH,
        "paperHeight": params.page.height / CM_PER_INCH,
        "marginTop": params.margin.top / CM_PER_INCH,
        "marginBottom": params.margin.bottom / CM_PER_INCH,
        "marginLeft": params.margin.left / CM_PER_INCH,
        "marginRight": params.margin.right / CM_PER_INCH,
        "pageRanges": page_ranges,
        "preferCSSPageSize": !params.shrink_to_fit,
    });
    let result = context
        .cdp_target
        .session()
        .send("Page.printToPDF", args)
        .await
        .map_err(|err| match err.protocol_message() {
            Some(message) if message.contains("content area is empty") => {
                Error::UnsupportedOperation("PDF content area is empty".into())
            }
            Some(message) if message.contains("Invalid page range") => {
                Error::invalid_argument(message.to_string())
            }
            _ => Error::from(err),
        })?;
    Ok(serde_json::json!({"data": result["data"]}))
}

async fn set_viewport(ctx: &MapperCtx, params: SetViewportParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    if !context.is_top_level() {
        return Err(Error::invalid_argument(
            "viewport can only be set on top-level contexts",
        ));
    }
    let session = context.cdp_target.session();
    match (&params.viewport, params.device_pixel_ratio) {
        (None, None) => {
            session
                .send("Emulation.clearDeviceMetricsOverride", serde_json::json!({}))
                .await?;
            context.cdp_target.set_previous_viewport(None);
        }
        (viewport, device_pixel_ratio) => {
            let (width, height) = match viewport {
                Some(v) => (v.width, v.height),
                // ratio-only override keeps the last dimensions
                None => context.cdp_target.previous_viewport().unwrap_or((0, 0)),
            };
            if width > MAX_VIEWPORT_DIMENSION || height > MAX_VIEWPORT_DIMENSION {
                return Err(Error::UnsupportedOperation(format!(
                    "viewport dimensions {width}x{height} are not supported"
                )));
            }
            session
                .send(
                    "Emulation.setDeviceMetricsOverride",
                    serde_json::json!({
                        "width": width,
                        "height": height,
                        "deviceScaleFactor": device_pixel_ratio.unwrap_or(0.0),
                        "mobile": false,
                    }),
                )
                .await?;
            if viewport.is_some() {
                context.cdp_target.set_previous_viewport(Some((width, height)));
            }
        }
    }
    Ok(serde_json::json!({}))
}

async fn handle_user_prompt(ctx: &MapperCtx, params: HandleUserPromptParams) -> Result<Value> {
    let context = ctx.contexts.get(&params.context)?;
    let open = ctx
        .prompts
        .lock()
        .expect("prompt map poisoned")
        .contains_key(&context.id);
    if !open {
        return Err(Error::NoSuchAlert(format!(
            "no user prompt open in context {}",
            context.id
        )));
    }
    let mut args = serde_json::json!({"accept": params.accept.unwrap_or(true)});
    if let Some(text) = &params.user_text {
        args["promptText"] = serde_json::json!(text);
    }
    context
        .cdp_target
        .session()
        .send("Page.handleJavaScriptDialog", args)
        .await?;
    Ok(serde_json::json!({}))
}

fn get_tree(ctx: &MapperCtx, params: GetTreeParams) -> Result<Value> {
    let contexts = ctx
        .contexts
        .get_tree(params.max_depth, params.root.as_deref())?;
    Ok(serde_json::json!({"contexts": contexts}))
}

/// CDP takes page ranges as a comma-joined string; entries are positive
/// integers or `from-to` pairs.
fn parse_page_ranges(ranges: &[Value]) -> Result<String> {
    let mut parts = Vec::with_capacity(ranges.len());
    for range in ranges {
        match range {
            Value::Number(n) if n.as_u64().is_some_and(|n| n > 0) => {
                parts.push(n.to_string());
            }
            Value::String(s) => {
                let valid = match s.split_once('-') {
                    Some((from, to)) => {
                        (from.is_empty() || from.chars().all(|c| c.is_ascii_digit()))
                            && (to.is_empty() || to.chars().all(|c| c.is_ascii_digit()))
                            && !(from.is_empty() && to.is_empty())
                    }
                    None => !s.is_empty() && s.chars().all(|c| c.is_ascii_digit()),
                };
                if !valid {
                    return Err(Error::invalid_argument(format!(
                        "invalid page range {s:?}"
                    )));
                }
                parts.push(s.clone());
            }
            other => {
                return Err(Error::invalid_argument(format!(
                    "invalid page range {other}"
                )));
            }
        }
    }
    Ok(parts.join(","))
}

fn intersect(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> (f64, f64, f64, f64) {
    let x = a.0.max(b.0);
    let y = a.1.max(b.1);
    let right = (a.0 + a.2).min(b.0 + b.2);
    let bottom = (a.1 + a.3).min(b.1 + b.3);
    (x, y, (right - x).max(0.0), (bottom - y).max(0.0))
}

fn content_bounds(quad: &Value) -> Option<(f64, f64, f64, f64)> {
    let values = quad.as_array()?;
    let coords: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
    if coords.len() != 8 {
        return None;
    }
    let xs = [coords[0], coords[2], coords[4], coords[6]];
    let ys = [coords[1], coords[3], coords[5], coords[7]];
    let min_x = xs.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_x = xs.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min_y = ys.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_y = ys.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    Some((min_x, min_y, max_x - min_x, max_y - min_y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_ranges_validation() {
        assert_eq!(
            parse_page_ranges(&[
                serde_json::json!(1),
                serde_json::json!("2-4"),
                serde_json::json!("7-"),
            ])
            .unwrap(),
            "1,2-4,7-"
        );
        assert!(parse_page_ranges(&[serde_json::json!("a-b")]).is_err());
        assert!(parse_page_ranges(&[serde_json::json!("-")]).is_err());
        assert!(parse_page_ranges(&[serde_json::json!(0)]).is_err());
        assert!(parse_page_ranges(&[serde_json::json!(2.5)]).is_err());
    }

    #[test]
    fn rect_intersection() {
        let full = (0.0, 0.0, 100.0, 100.0);
        assert_eq!(intersect(full, (10.0, 10.0, 20.0, 20.0)), (10.0, 10.0, 20.0, 20.0));
        // clip poking out is truncated
        assert_eq!(intersect(full, (90.0, 90.0, 20.0, 20.0)), (90.0, 90.0, 10.0, 10.0));
        // disjoint clips collapse to zero area
        let empty = intersect(full, (200.0, 200.0, 10.0, 10.0));
        assert_eq!((empty.2, empty.3), (0.0, 0.0));
    }
}
