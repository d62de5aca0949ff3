//! Parameter types for the `input` module: per-source action sequences as
//! delivered by `input.performActions`.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformActionsParams {
    pub context: String,
    pub actions: Vec<SourceActions>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseActionsParams {
    pub context: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetFilesParams {
    pub context: String,
    pub element: crate::bidi::script::SharedReference,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PointerType {
    #[default]
    Mouse,
    Pen,
    Touch,
}

impl PointerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PointerType::Mouse => "mouse",
            PointerType::Pen => "pen",
            PointerType::Touch => "touch",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerParameters {
    #[serde(default)]
    pub pointer_type: PointerType,
}

/// One input source column of `performActions`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SourceActions {
    #[serde(rename_all = "camelCase")]
    None { id: String, actions: Vec<NoneAction> },
    #[serde(rename_all = "camelCase")]
    Key { id: String, actions: Vec<KeyAction> },
    #[serde(rename_all = "camelCase")]
    Pointer {
        id: String,
        #[serde(default)]
        parameters: PointerParameters,
        actions: Vec<PointerAction>,
    },
    #[serde(rename_all = "camelCase")]
    Wheel { id: String, actions: Vec<WheelAction> },
}

impl SourceActions {
    pub fn id(&self) -> &str {
        match self {
            SourceActions::None { id, .. }
            | SourceActions::Key { id, .. }
            | SourceActions::Pointer { id, .. }
            | SourceActions::Wheel { id, .. } => id,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SourceActions::None { actions, .. } => actions.len(),
            SourceActions::Key { actions, .. } => actions.len(),
            SourceActions::Pointer { actions, .. } => actions.len(),
            SourceActions::Wheel { actions, .. } => actions.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NoneAction {
    #[serde(rename_all = "camelCase")]
    Pause {
        #[serde(default)]
        duration: Option<u64>,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum KeyAction {
    #[serde(rename_all = "camelCase")]
    Pause {
        #[serde(default)]
        duration: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    KeyDown { value: String },
    #[serde(rename_all = "camelCase")]
    KeyUp { value: String },
}

/// Where pointer coordinates are anchored.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Origin {
    Keyword(OriginKeyword),
    #[serde(rename_all = "camelCase")]
    Element {
        #[serde(rename = "type")]
        kind: ElementOriginTag,
        element: crate::bidi::script::SharedReference,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OriginKeyword {
    Viewport,
    Pointer,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ElementOriginTag {
    Element,
}

impl Default for Origin {
    fn default() -> Self {
        Origin::Keyword(OriginKeyword::Viewport)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerCommonProperties {
    #[serde(default)]
    pub width: Option<f64>,
    #[serde(default)]
    pub height: Option<f64>,
    #[serde(default)]
    pub pressure: Option<f64>,
    #[serde(default)]
    pub tangential_pressure: Option<f64>,
    #[serde(default)]
    pub twist: Option<u64>,
    #[serde(default)]
    pub altitude_angle: Option<f64>,
    #[serde(default)]
    pub azimuth_angle: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PointerAction {
    #[serde(rename_all = "camelCase")]
    Pause {
        #[serde(default)]
        duration: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    PointerDown {
        button: u64,
        #[serde(flatten)]
        properties: PointerCommonProperties,
    },
    #[serde(rename_all = "camelCase")]
    PointerUp { button: u64 },
    #[serde(rename_all = "camelCase")]
    PointerMove {
        x: f64,
        y: f64,
        #[serde(default)]
        duration: Option<u64>,
        #[serde(default)]
        origin: Option<Origin>,
        #[serde(flatten)]
        properties: PointerCommonProperties,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WheelAction {
    #[serde(rename_all = "camelCase")]
    Pause {
        #[serde(default)]
        duration: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Scroll {
        x: f64,
        y: f64,
        delta_x: f64,
        delta_y: f64,
        #[serde(default)]
        duration: Option<u64>,
        #[serde(default)]
        origin: Option<Origin>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pointer_actions() {
        let params: PerformActionsParams = serde_json::from_value(serde_json::json!({
            "context": "ctx",
            "actions": [{
                "type": "pointer",
                "id": "mouse1",
                "parameters": {"pointerType": "mouse"},
                "actions": [
                    {"type": "pointerMove", "x": 10.0, "y": 20.0, "duration": 100},
                    {"type": "pointerDown", "button": 0},
                    {"type": "pause", "duration": 50},
                    {"type": "pointerUp", "button": 0}
                ]
            }]
        }))
        .unwrap();
        assert_eq!(params.actions.len(), 1);
        assert_eq!(params.actions[0].len(), 4);
        assert_eq!(params.actions[0].id(), "mouse1");
    }

    #[test]
    fn parses_element_origin() {
        let action: PointerAction = serde_json::from_value(serde_json::json!({
            "type": "pointerMove",
            "x": 0.0,
            "y": 0.0,
            "origin": {"type": "element", "element": {"sharedId": "f.1.d.2.e.42"}}
        }))
        .unwrap();
        match action {
            PointerAction::PointerMove {
                origin: Some(Origin::Element { element, .. }),
                ..
            } => assert_eq!(element.shared_id, "f.1.d.2.e.42"),
            other => panic!("unexpected parse: {other:?}"),
        }
    }
}
