//! Translates `performActions` ticks into CDP input events. Each tick is
//! dispatched atomically: every action in the column starts in parallel and
//! the tick ends only when all of them and the tick timer have finished,
//! the timer running for the longest `duration` in the column.

use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::bidi::input::{
    KeyAction, NoneAction, Origin, OriginKeyword, PointerAction, PointerCommonProperties,
    PointerType, SourceActions, WheelAction,
};
use crate::bidi::script::SharedReference;
use crate::cdp::CdpSession;
use crate::error::{Error, Result};
use crate::handler::context::BrowsingContextStorage;
use crate::handler::input::keys::{self, MODIFIER_META};
use crate::handler::input::sources::{CancelAction, ContextInput};

pub struct ActionDispatcher {
    /// The context the actions were addressed to; may be nested.
    context_id: String,
    /// Input events always go to the top-level target.
    session: CdpSession,
    /// Element lookups go to the session owning the node.
    node_session: CdpSession,
    contexts: BrowsingContextStorage,
    input: ContextInput,
    mac: bool,
}

impl std::fmt::Debug for ActionDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionDispatcher")
            .field("context_id", &self.context_id)
            .finish()
    }
}

impl ActionDispatcher {
    pub fn new(
        context_id: String,
        session: CdpSession,
        node_session: CdpSession,
        contexts: BrowsingContextStorage,
        input: ContextInput,
        mac: bool,
    ) -> Self {
        Self {
            context_id,
            session,
            node_session,
            contexts,
            input,
            mac,
        }
    }

    /// Dispatch all ticks of a `performActions` payload.
    pub async fn dispatch(&self, actions: &[SourceActions]) -> Result<()> {
        // create and type-check every source before touching the wire
        {
            let mut state = self.input.state.lock().expect("input state poisoned");
            for source in actions {
                match source {
                    SourceActions::None { id, .. } => {
                        state.source_mut(id, "none", None)?;
                    }
                    SourceActions::Key { id, .. } => {
                        state.source_mut(id, "key", None)?;
                    }
                    SourceActions::Pointer { id, parameters, .. } => {
                        state.source_mut(id, "pointer", Some(parameters.pointer_type))?;
                    }
                    SourceActions::Wheel { id, .. } => {
                        state.source_mut(id, "wheel", None)?;
                    }
                }
            }
        }

        let ticks = actions.iter().map(SourceActions::len).max().unwrap_or(0);
        for tick in 0..ticks {
            let mut duration: u64 = 0;
            let mut jobs: Vec<BoxFuture<'_, Result<()>>> = Vec::new();

            for source in actions {
                match source {
                    SourceActions::None { actions, .. } => {
                        if let Some(NoneAction::Pause { duration: d }) = actions.get(tick) {
                            duration = duration.max(d.unwrap_or(0));
                        }
                    }
                    SourceActions::Key { id, actions } => match actions.get(tick) {
                        Some(KeyAction::Pause { duration: d }) => {
                            duration = duration.max(d.unwrap_or(0));
                        }
                        Some(KeyAction::KeyDown { value }) => {
                            jobs.push(self.key_down(id, value).boxed());
                        }
                        Some(KeyAction::KeyUp { value }) => {
                            jobs.push(self.key_up(id, value).boxed());
                        }
                        None => {}
                    },
                    SourceActions::Pointer {
                        id,
                        parameters,
                        actions,
                    } => match actions.get(tick) {
                        Some(PointerAction::Pause { duration: d }) => {
                            duration = duration.max(d.unwrap_or(0));
                        }
                        Some(PointerAction::PointerDown { button, properties }) => {
                            jobs.push(
                                self.pointer_down(id, parameters.pointer_type, *button, properties)
                                    .boxed(),
                            );
                        }
                        Some(PointerAction::PointerUp { button }) => {
                            jobs.push(
                                self.pointer_up(id, parameters.pointer_type, *button).boxed(),
                            );
                        }
                        Some(PointerAction::PointerMove {
                            x,
                            y,
                            duration: d,
                            origin,
                            properties,
                        }) => {
                            duration = duration.max(d.unwrap_or(0));
                            jobs.push(
                                self.pointer_move(
                                    id,
                                    parameters.pointer_type,
                                    *x,
                                    *y,
                                    d.unwrap_or(0),
                                    origin.as_ref(),
                                    properties,
                                )
                                .boxed(),
                            );
                        }
                        None => {}
                    },
                    SourceActions::Wheel { id, actions } => match actions.get(tick) {
                        Some(WheelAction::Pause { duration: d }) => {
                            duration = duration.max(d.unwrap_or(0));
                        }
                        Some(WheelAction::Scroll {
                            x,
                            y,
                            delta_x,
                            delta_y,
                            duration: d,
                            origin,
                        }) => {
                            duration = duration.max(d.unwrap_or(0));
                            jobs.push(
                                self.scroll(
                                    id,
                                    *x,
                                    *y,
                                    *delta_x,
                                    *delta_y,
                                    d.unwrap_or(0),
                                    origin.as_ref(),
                                )
                                .boxed(),
                            );
                        }
                        None => {}
                    },
                }
            }

            let timer = tokio::time::sleep(Duration::from_millis(duration));
            let (results, ()) = futures::join!(futures::future::join_all(jobs), timer);
            for result in results {
                result?;
            }
        }
        Ok(())
    }

    /// Replay the cancel list in reverse.
    pub async fn release(&self) -> Result<()> {
        let cancels = {
            let mut state = self.input.state.lock().expect("input state poisoned");
            std::mem::take(&mut state.cancel_list)
        };
        for action in cancels.into_iter().rev() {
            match action {
                CancelAction::KeyUp { source_id, value } => {
                    self.key_up(&source_id, &value).await?;
                }
                CancelAction::PointerUp { source_id, button } => {
                    self.pointer_up(&source_id, PointerType::Mouse, button).await?;
                }
            }
        }
        Ok(())
    }

    async fn key_down(&self, source_id: &str, raw: &str) -> Result<()> {
        let (info, modifiers) = {
            let mut state = self.input.state.lock().expect("input state poisoned");
            let source = state.key_source_mut(source_id)?;
            let info = keys::resolve(raw, source.shift_held())?;
            if let Some(bit) = keys::modifier_bit(&info.key) {
                source.modifiers |= bit;
            }
            source.pressed.insert(info.key.clone());
            let modifiers = state.modifiers();
            state.cancel_list.push(CancelAction::KeyUp {
                source_id: source_id.to_string(),
                value: raw.to_string(),
            });
            (info, modifiers)
        };

        let mut params = serde_json::json!({
            "type": if info.text.is_some() { "keyDown" } else { "rawKeyDown" },
            "modifiers": modifiers,
            "key": info.key,
            "code": info.code,
            "windowsVirtualKeyCode": info.key_code,
            "location": info.location,
            "isKeypad": info.is_keypad(),
        });
        if let Some(text) = &info.text {
            params["text"] = serde_json::json!(text);
        }
        if let Some(text) = &info.unmodified_text {
            params["unmodifiedText"] = serde_json::json!(text);
        }
        if self.mac && modifiers & MODIFIER_META != 0 {
            if let Some(command) = editing_command(&info.key) {
                params["commands"] = serde_json::json!([command]);
            }
        }
        self.session.send("Input.dispatchKeyEvent", params).await?;

        if info.key == "Escape" && modifiers == 0 {
            // drag sessions swallow Escape otherwise
            let _ = self
                .session
                .send("Input.cancelDragging", serde_json::json!({}))
                .await;
        }
        Ok(())
    }

    async fn key_up(&self, source_id: &str, raw: &str) -> Result<()> {
        let (info, modifiers) = {
            let mut state = self.input.state.lock().expect("input state poisoned");
            let source = state.key_source_mut(source_id)?;
            let info = keys::resolve(raw, source.shift_held())?;
            if !source.pressed.remove(&info.key) {
                return Ok(());
            }
            if let Some(bit) = keys::modifier_bit(&info.key) {
                source.modifiers &= !bit;
            }
            (info, state.modifiers())
        };

        let mut params = serde_json::json!({
            "type": "keyUp",
            "modifiers": modifiers,
            "key": info.key,
            "code": info.code,
            "windowsVirtualKeyCode": info.key_code,
            "location": info.location,
            "isKeypad": info.is_keypad(),
        });
        if let Some(text) = &info.text {
            params["text"] = serde_json::json!(text);
        }
        self.session.send("Input.dispatchKeyEvent", params).await?;
        Ok(())
    }

    async fn pointer_down(
        &self,
        source_id: &str,
        pointer_type: PointerType,
        button: u64,
        properties: &PointerCommonProperties,
    ) -> Result<()> {
        let button_name = button_name(button)?;
        let (x, y, click_count, modifiers) = {
            let mut state = self.input.state.lock().expect("input state poisoned");
            let modifiers = state.modifiers();
            let source = state.pointer_source_mut(source_id, Some(pointer_type))?;
            source.pressed.insert(button);
            let (x, y) = (source.x, source.y);
            let count = source.click(x, y, button, Instant::now());
            state.cancel_list.push(CancelAction::PointerUp {
                source_id: source_id.to_string(),
                button,
            });
            (x, y, count, modifiers)
        };

        match pointer_type {
            PointerType::Touch => {
                self.session
                    .send(
                        "Input.dispatchTouchEvent",
                        serde_json::json!({
                            "type": "touchStart",
                            "touchPoints": [touch_point(x, y, properties)],
                            "modifiers": modifiers,
                        }),
                    )
                    .await?;
            }
            _ => {
                self.session
                    .send(
                        "Input.dispatchMouseEvent",
                        serde_json::json!({
                            "type": "mousePressed",
                            "x": x,
                            "y": y,
                            "button": button_name,
                            "clickCount": click_count,
                            "modifiers": modifiers,
                            "pointerType": pointer_type.as_str(),
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    async fn pointer_up(&self, source_id: &str, _hint: PointerType, button: u64) -> Result<()> {
        let button_name = button_name(button)?;
        let (x, y, click_count, modifiers, pointer_type) = {
            let mut state = self.input.state.lock().expect("input state poisoned");
            let modifiers = state.modifiers();
            let source = state.pointer_source_mut(source_id, None)?;
            source.pressed.remove(&button);
            (
                source.x,
                source.y,
                source.click_count(),
                modifiers,
                source.subtype,
            )
        };

        match pointer_type {
            PointerType::Touch => {
                self.session
                    .send(
                        "Input.dispatchTouchEvent",
                        serde_json::json!({
                            "type": "touchEnd",
                            "touchPoints": [],
                            "modifiers": modifiers,
                        }),
                    )
                    .await?;
            }
            _ => {
                self.session
                    .send(
                        "Input.dispatchMouseEvent",
                        serde_json::json!({
                            "type": "mouseReleased",
                            "x": x,
                            "y": y,
                            "button": button_name,
                            "clickCount": click_count,
                            "modifiers": modifiers,
                            "pointerType": pointer_type.as_str(),
                        }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pointer_move(
        &self,
        source_id: &str,
        pointer_type: PointerType,
        x: f64,
        y: f64,
        duration: u64,
        origin: Option<&Origin>,
        properties: &PointerCommonProperties,
    ) -> Result<()> {
        let (start_x, start_y, modifiers) = {
            let mut state = self.input.state.lock().expect("input state poisoned");
            let modifiers = state.modifiers();
            let source = state.pointer_source_mut(source_id, Some(pointer_type))?;
            (source.x, source.y, modifiers)
        };

        let (target_x, target_y) = self
            .resolve_target(origin, x, y, start_x, start_y, false)
            .await?;
        if target_x < 0.0 || target_y < 0.0 {
            return Err(Error::MoveTargetOutOfBounds(format!(
                "move target ({target_x}, {target_y}) is out of bounds"
            )));
        }

        let steps = if duration == 0 { 1 } else { (duration / 16).max(1) };
        let mut last = (start_x.round() as i64, start_y.round() as i64);
        for step in 1..=steps {
            if duration > 0 {
                tokio::time::sleep(Duration::from_millis(duration / steps)).await;
            }
            let t = step as f64 / steps as f64;
            let cx = start_x + (target_x - start_x) * t;
            let cy = start_y + (target_y - start_y) * t;
            let point = (cx.round() as i64, cy.round() as i64);
            // only integer coordinate changes produce events
            if point == last && step != steps {
                continue;
            }
            last = point;
            match pointer_type {
                PointerType::Touch => {
                    self.session
                        .send(
                            "Input.dispatchTouchEvent",
                            serde_json::json!({
                                "type": "touchMove",
                                "touchPoints": [touch_point(
                                    point.0 as f64,
                                    point.1 as f64,
                                    properties,
                                )],
                                "modifiers": modifiers,
                            }),
                        )
                        .await?;
                }
                _ => {
                    self.session
                        .send(
                            "Input.dispatchMouseEvent",
                            serde_json::json!({
                                "type": "mouseMoved",
                                "x": point.0,
                                "y": point.1,
                                "modifiers": modifiers,
                                "pointerType": pointer_type.as_str(),
                            }),
                        )
                        .await?;
                }
            }
        }

        let mut state = self.input.state.lock().expect("input state poisoned");
        let source = state.pointer_source_mut(source_id, None)?;
        source.x = target_x;
        source.y = target_y;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn scroll(
        &self,
        source_id: &str,
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
        duration: u64,
        origin: Option<&Origin>,
    ) -> Result<()> {
        let modifiers = {
            let mut state = self.input.state.lock().expect("input state poisoned");
            state.source_mut(source_id, "wheel", None)?;
            state.modifiers()
        };

        let (target_x, target_y) = self.resolve_target(origin, x, y, 0.0, 0.0, true).await?;
        if target_x < 0.0 || target_y < 0.0 {
            return Err(Error::MoveTargetOutOfBounds(format!(
                "scroll target ({target_x}, {target_y}) is out of bounds"
            )));
        }

        let steps = if duration == 0 { 1 } else { (duration / 16).max(1) };
        let mut last = (0i64, 0i64);
        for step in 1..=steps {
            if duration > 0 {
                tokio::time::sleep(Duration::from_millis(duration / steps)).await;
            }
            let t = step as f64 / steps as f64;
            let current = ((delta_x * t).round() as i64, (delta_y * t).round() as i64);
            let (dx, dy) = (current.0 - last.0, current.1 - last.1);
            if dx == 0 && dy == 0 {
                continue;
            }
            last = current;
            self.session
                .send(
                    "Input.dispatchMouseEvent",
                    serde_json::json!({
                        "type": "mouseWheel",
                        "x": target_x,
                        "y": target_y,
                        "deltaX": dx,
                        "deltaY": dy,
                        "modifiers": modifiers,
                    }),
                )
                .await?;
        }
        Ok(())
    }

    /// Absolute target coordinates for a move or scroll.
    async fn resolve_target(
        &self,
        origin: Option<&Origin>,
        x: f64,
        y: f64,
        current_x: f64,
        current_y: f64,
        scroll: bool,
    ) -> Result<(f64, f64)> {
        match origin.unwrap_or(&Origin::Keyword(OriginKeyword::Viewport)) {
            Origin::Keyword(OriginKeyword::Viewport) => Ok((x, y)),
            Origin::Keyword(OriginKeyword::Pointer) => {
                if scroll {
                    return Err(Error::invalid_argument(
                        "scroll does not support the pointer origin",
                    ));
                }
                Ok((current_x + x, current_y + y))
            }
            Origin::Element { element, .. } => {
                let (cx, cy) = self.element_center(element).await?;
                let (ox, oy) = self.frame_offset().await?;
                Ok((cx + ox + x, cy + oy + y))
            }
        }
    }

    /// Center of the content box of a shared DOM node reference.
    async fn element_center(&self, element: &SharedReference) -> Result<(f64, f64)> {
        let backend_node_id = backend_node_id(&element.shared_id)?;
        let result = self
            .node_session
            .send(
                "DOM.getBoxModel",
                serde_json::json!({"backendNodeId": backend_node_id}),
            )
            .await
            .map_err(|err| Error::NoSuchNode(format!("cannot resolve element: {err}")))?;
        quad_center(&result["model"]["content"]).ok_or_else(|| {
            Error::NoSuchNode(format!(
                "no box model for shared id {:?}",
                element.shared_id
            ))
        })
    }

    /// Accumulated offset of the context's frame chain, for input against
    /// OOPIF documents: pointer events land on the top-level target.
    async fn frame_offset(&self) -> Result<(f64, f64)> {
        let (mut ox, mut oy) = (0.0, 0.0);
        let mut current = self.contexts.get(&self.context_id)?;
        while let Some(parent_id) = current.parent.clone() {
            let parent = self.contexts.get(&parent_id)?;
            let parent_session = parent.cdp_target.session();
            let owner = parent_session
                .send(
                    "DOM.getFrameOwner",
                    serde_json::json!({"frameId": current.id}),
                )
                .await
                .map_err(|err| Error::unknown(format!("cannot resolve frame owner: {err}")))?;
            if let Some(backend_node_id) = owner.get("backendNodeId").and_then(|v| v.as_u64()) {
                let model = parent_session
                    .send(
                        "DOM.getBoxModel",
                        serde_json::json!({"backendNodeId": backend_node_id}),
                    )
                    .await
                    .map_err(|err| Error::unknown(format!("cannot resolve frame box: {err}")))?;
                if let Some(content) = model["model"]["content"].as_array() {
                    if content.len() >= 2 {
                        ox += content[0].as_f64().unwrap_or(0.0);
                        oy += content[1].as_f64().unwrap_or(0.0);
                    }
                }
            }
            current = parent;
        }
        Ok((ox, oy))
    }
}

fn editing_command(key: &str) -> Option<&'static str> {
    match key {
        "a" | "A" => Some("selectAll"),
        "c" | "C" => Some("copy"),
        "v" | "V" => Some("paste"),
        "x" | "X" => Some("cut"),
        "z" | "Z" => Some("undo"),
        _ => None,
    }
}

fn button_name(button: u64) -> Result<&'static str> {
    Ok(match button {
        0 => "left",
        1 => "middle",
        2 => "right",
        3 => "back",
        4 => "forward",
        other => {
            return Err(Error::invalid_argument(format!(
                "unknown pointer button: {other}"
            )))
        }
    })
}

fn touch_point(x: f64, y: f64, properties: &PointerCommonProperties) -> serde_json::Value {
    let mut point = serde_json::json!({"x": x, "y": y});
    if let Some(width) = properties.width {
        point["radiusX"] = serde_json::json!(width / 2.0);
    }
    if let Some(height) = properties.height {
        point["radiusY"] = serde_json::json!(height / 2.0);
    }
    if let Some(pressure) = properties.pressure {
        point["force"] = serde_json::json!(pressure);
    }
    point
}

/// Backend node id from a shared reference id
/// (`f.<frameId>.d.<documentId>.e.<backendNodeId>`).
pub fn backend_node_id(shared_id: &str) -> Result<u64> {
    shared_id
        .rsplit(".e.")
        .next()
        .and_then(|tail| tail.parse::<u64>().ok())
        .ok_or_else(|| {
            Error::NoSuchNode(format!("malformed shared id: {shared_id:?}"))
        })
}

fn quad_center(quad: &serde_json::Value) -> Option<(f64, f64)> {
    let values = quad.as_array()?;
    if values.len() != 8 {
        return None;
    }
    let coords: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
    if coords.len() != 8 {
        return None;
    }
    let cx = (coords[0] + coords[2] + coords[4] + coords[6]) / 4.0;
    let cy = (coords[1] + coords[3] + coords[5] + coords[7]) / 4.0;
    Some((cx, cy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_id_parsing() {
        assert_eq!(backend_node_id("f.frame.d.doc.e.42").unwrap(), 42);
        assert_eq!(
            backend_node_id("nonsense").unwrap_err().code(),
            "no such node"
        );
    }

    #[test]
    fn quad_center_averages_corners() {
        let quad = serde_json::json!([0.0, 0.0, 10.0, 0.0, 10.0, 20.0, 0.0, 20.0]);
        assert_eq!(quad_center(&quad), Some((5.0, 10.0)));
        assert_eq!(quad_center(&serde_json::json!([1, 2])), None);
    }

    #[test]
    fn unknown_buttons_are_invalid() {
        assert!(button_name(0).is_ok());
        assert_eq!(button_name(9).unwrap_err().code(), "invalid argument");
    }
}
