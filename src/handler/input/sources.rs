//! Per top-level-context input source state. Sources are created on first
//! use by `performActions` and live until `releaseActions` forgets them.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use hashbrown::{HashMap, HashSet};

use crate::bidi::input::PointerType;
use crate::deferred::ProcessingQueue;
use crate::error::{Error, Result};

/// Double-click window and slop radius for click counting.
const CLICK_WINDOW_MS: u128 = 500;
const CLICK_RADIUS: f64 = 2.0;

#[derive(Debug, Default)]
pub struct KeySource {
    pub pressed: HashSet<String>,
    /// Alt=1, Ctrl=2, Meta=4, Shift=8.
    pub modifiers: u8,
}

impl KeySource {
    pub fn shift_held(&self) -> bool {
        self.modifiers & super::keys::MODIFIER_SHIFT != 0
    }
}

#[derive(Debug, Clone, Default)]
struct LastClick {
    x: f64,
    y: f64,
    button: u64,
    at: Option<Instant>,
    count: u64,
}

#[derive(Debug)]
pub struct PointerSource {
    pub subtype: PointerType,
    pub pressed: HashSet<u64>,
    pub x: f64,
    pub y: f64,
    last_click: LastClick,
}

impl PointerSource {
    fn new(subtype: PointerType) -> Self {
        Self {
            subtype,
            pressed: HashSet::new(),
            x: 0.0,
            y: 0.0,
            last_click: LastClick::default(),
        }
    }

    /// Register a press and return the resulting click count: consecutive
    /// clicks of the same button within 500 ms and 2 px stack up.
    pub fn click(&mut self, x: f64, y: f64, button: u64, now: Instant) -> u64 {
        let stacked = self.last_click.at.is_some_and(|at| {
            now.duration_since(at).as_millis() <= CLICK_WINDOW_MS
                && self.last_click.button == button
                && (x - self.last_click.x).abs() <= CLICK_RADIUS
                && (y - self.last_click.y).abs() <= CLICK_RADIUS
        });
        let count = if stacked { self.last_click.count + 1 } else { 1 };
        self.last_click = LastClick {
            x,
            y,
            button,
            at: Some(now),
            count,
        };
        count
    }

    pub fn click_count(&self) -> u64 {
        self.last_click.count.max(1)
    }
}

#[derive(Debug)]
pub enum InputSource {
    None,
    Key(KeySource),
    Pointer(PointerSource),
    Wheel,
}

impl InputSource {
    fn kind(&self) -> &'static str {
        match self {
            InputSource::None => "none",
            InputSource::Key(_) => "key",
            InputSource::Pointer(_) => "pointer",
            InputSource::Wheel => "wheel",
        }
    }
}

/// Undo entries accumulated by `performActions`, replayed in reverse by
/// `releaseActions`.
#[derive(Debug, Clone)]
pub enum CancelAction {
    KeyUp {
        source_id: String,
        value: String,
    },
    PointerUp {
        source_id: String,
        button: u64,
    },
}

#[derive(Debug, Default)]
pub struct InputState {
    sources: HashMap<String, InputSource>,
    pub cancel_list: Vec<CancelAction>,
}

impl InputState {
    /// Fetch a source, creating it with the requested shape. Reusing an id
    /// with a different source type or pointer subtype is an error.
    pub fn source_mut(
        &mut self,
        id: &str,
        kind: &'static str,
        pointer_type: Option<PointerType>,
    ) -> Result<&mut InputSource> {
        if !self.sources.contains_key(id) {
            let source = match kind {
                "none" => InputSource::None,
                "key" => InputSource::Key(KeySource::default()),
                "pointer" => {
                    InputSource::Pointer(PointerSource::new(pointer_type.unwrap_or_default()))
                }
                "wheel" => InputSource::Wheel,
                _ => return Err(Error::invalid_argument(format!("unknown source type {kind}"))),
            };
            self.sources.insert(id.to_string(), source);
        }
        let source = self
            .sources
            .get_mut(id)
            .expect("source inserted above");
        if source.kind() != kind {
            return Err(Error::invalid_argument(format!(
                "input source {id} is a {} source, not {kind}",
                source.kind()
            )));
        }
        if let (InputSource::Pointer(pointer), Some(requested)) = (&mut *source, pointer_type) {
            if pointer.subtype != requested {
                return Err(Error::invalid_argument(format!(
                    "input source {id} is a {} pointer, not {}",
                    pointer.subtype.as_str(),
                    requested.as_str()
                )));
            }
        }
        Ok(source)
    }

    pub fn key_source_mut(&mut self, id: &str) -> Result<&mut KeySource> {
        match self.source_mut(id, "key", None)? {
            InputSource::Key(key) => Ok(key),
            _ => unreachable!("source_mut checked the kind"),
        }
    }

    pub fn pointer_source_mut(
        &mut self,
        id: &str,
        pointer_type: Option<PointerType>,
    ) -> Result<&mut PointerSource> {
        match self.source_mut(id, "pointer", pointer_type)? {
            InputSource::Pointer(pointer) => Ok(pointer),
            _ => unreachable!("source_mut checked the kind"),
        }
    }

    /// The combined modifier mask over every key source.
    pub fn modifiers(&self) -> u8 {
        self.sources
            .values()
            .map(|source| match source {
                InputSource::Key(key) => key.modifiers,
                _ => 0,
            })
            .fold(0, |acc, m| acc | m)
    }
}

/// One [`InputState`] plus the queue serializing `performActions` calls for
/// its context.
#[derive(Debug, Clone)]
pub struct ContextInput {
    pub state: Arc<Mutex<InputState>>,
    pub queue: ProcessingQueue,
}

impl Default for ContextInput {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(InputState::default())),
            queue: ProcessingQueue::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InputStateManager {
    inner: Arc<Mutex<HashMap<String, ContextInput>>>,
}

impl InputStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, top_level_context: &str) -> ContextInput {
        self.inner
            .lock()
            .expect("input state poisoned")
            .entry(top_level_context.to_string())
            .or_default()
            .clone()
    }

    /// Forget everything about a context (releaseActions, context gone).
    pub fn delete(&self, top_level_context: &str) {
        self.inner
            .lock()
            .expect("input state poisoned")
            .remove(top_level_context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn click_counting_window_and_radius() {
        let mut pointer = PointerSource::new(PointerType::Mouse);
        let start = Instant::now();
        assert_eq!(pointer.click(10.0, 10.0, 0, start), 1);
        // inside window and radius
        assert_eq!(
            pointer.click(11.5, 9.0, 0, start + Duration::from_millis(400)),
            2
        );
        // outside the radius
        assert_eq!(
            pointer.click(20.0, 10.0, 0, start + Duration::from_millis(450)),
            1
        );
        // outside the window
        assert_eq!(
            pointer.click(20.0, 10.0, 0, start + Duration::from_millis(1000)),
            1
        );
        // different button
        assert_eq!(
            pointer.click(20.0, 10.0, 2, start + Duration::from_millis(1050)),
            1
        );
    }

    #[test]
    fn source_subtype_changes_are_rejected() {
        let mut state = InputState::default();
        state
            .pointer_source_mut("p", Some(PointerType::Mouse))
            .unwrap();
        let err = state
            .pointer_source_mut("p", Some(PointerType::Touch))
            .unwrap_err();
        assert_eq!(err.code(), "invalid argument");
        let err = state.key_source_mut("p").unwrap_err();
        assert_eq!(err.code(), "invalid argument");
    }

    #[test]
    fn modifiers_combine_across_key_sources() {
        let mut state = InputState::default();
        state.key_source_mut("k1").unwrap().modifiers = super::super::keys::MODIFIER_SHIFT;
        state.key_source_mut("k2").unwrap().modifiers = super::super::keys::MODIFIER_CTRL;
        assert_eq!(
            state.modifiers(),
            super::super::keys::MODIFIER_SHIFT | super::super::keys::MODIFIER_CTRL
        );
    }
}
