//! US-layout key normalization: WebDriver key codepoints and raw graphemes
//! resolve to the key/code/keycode/location quadruple CDP key events need.

use phf::phf_map;

use crate::error::{Error, Result};

/// Modifier bits, shared between the per-source mask and CDP's `modifiers`
/// field: Alt=1, Ctrl=2, Meta=4, Shift=8.
pub const MODIFIER_ALT: u8 = 1;
pub const MODIFIER_CTRL: u8 = 2;
pub const MODIFIER_META: u8 = 4;
pub const MODIFIER_SHIFT: u8 = 8;

/// Resolved key data for one `keyDown`/`keyUp` action.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyInfo {
    pub key: String,
    pub code: String,
    pub key_code: u32,
    pub location: u32,
    /// Text inserted by the key, shift applied.
    pub text: Option<String>,
    /// Text the key would insert without modifiers.
    pub unmodified_text: Option<String>,
}

impl KeyInfo {
    pub fn is_keypad(&self) -> bool {
        self.location == 3
    }
}

/// The modifier bit of a named modifier key.
pub fn modifier_bit(key: &str) -> Option<u8> {
    match key {
        "Alt" => Some(MODIFIER_ALT),
        "Control" => Some(MODIFIER_CTRL),
        "Meta" => Some(MODIFIER_META),
        "Shift" => Some(MODIFIER_SHIFT),
        _ => None,
    }
}

/// Translate a WebDriver key codepoint (U+E000 block) into its named key.
fn webdriver_key(c: char) -> Option<&'static str> {
    Some(match c {
        '\u{E000}' => "Unidentified",
        '\u{E001}' => "Cancel",
        '\u{E002}' => "Help",
        '\u{E003}' => "Backspace",
        '\u{E004}' => "Tab",
        '\u{E005}' => "Clear",
        '\u{E006}' => "Return",
        '\u{E007}' => "Enter",
        '\u{E008}' => "Shift",
        '\u{E009}' => "Control",
        '\u{E00A}' => "Alt",
        '\u{E00B}' => "Pause",
        '\u{E00C}' => "Escape",
        '\u{E00D}' => " ",
        '\u{E00E}' => "PageUp",
        '\u{E00F}' => "PageDown",
        '\u{E010}' => "End",
        '\u{E011}' => "Home",
        '\u{E012}' => "ArrowLeft",
        '\u{E013}' => "ArrowUp",
        '\u{E014}' => "ArrowRight",
        '\u{E015}' => "ArrowDown",
        '\u{E016}' => "Insert",
        '\u{E017}' => "Delete",
        '\u{E018}' => ";",
        '\u{E019}' => "=",
        '\u{E01A}' => "0",
        '\u{E01B}' => "1",
        '\u{E01C}' => "2",
        '\u{E01D}' => "3",
        '\u{E01E}' => "4",
        '\u{E01F}' => "5",
        '\u{E020}' => "6",
        '\u{E021}' => "7",
        '\u{E022}' => "8",
        '\u{E023}' => "9",
        '\u{E024}' => "*",
        '\u{E025}' => "+",
        '\u{E026}' => ",",
        '\u{E027}' => "-",
        '\u{E028}' => ".",
        '\u{E029}' => "/",
        '\u{E031}' => "F1",
        '\u{E032}' => "F2",
        '\u{E033}' => "F3",
        '\u{E034}' => "F4",
        '\u{E035}' => "F5",
        '\u{E036}' => "F6",
        '\u{E037}' => "F7",
        '\u{E038}' => "F8",
        '\u{E039}' => "F9",
        '\u{E03A}' => "F10",
        '\u{E03B}' => "F11",
        '\u{E03C}' => "F12",
        '\u{E03D}' => "Meta",
        '\u{E040}' => "ZenkakuHankaku",
        '\u{E050}' => "Shift",
        '\u{E051}' => "Control",
        '\u{E052}' => "Alt",
        '\u{E053}' => "Meta",
        '\u{E054}' => "PageUp",
        '\u{E055}' => "PageDown",
        '\u{E056}' => "End",
        '\u{E057}' => "Home",
        '\u{E058}' => "ArrowLeft",
        '\u{E059}' => "ArrowUp",
        '\u{E05A}' => "ArrowRight",
        '\u{E05B}' => "ArrowDown",
        '\u{E05C}' => "Insert",
        '\u{E05D}' => "Delete",
        _ => return None,
    })
}

/// Whether the codepoint addresses the numpad variant of a key.
fn is_numpad_codepoint(c: char) -> bool {
    matches!(c, '\u{E01A}'..='\u{E029}' | '\u{E054}'..='\u{E05D}')
}

fn right_modifier_code(c: char) -> Option<&'static str> {
    Some(match c {
        '\u{E050}' => "ShiftRight",
        '\u{E051}' => "ControlRight",
        '\u{E052}' => "AltRight",
        '\u{E053}' => "MetaRight",
        _ => return None,
    })
}

/// (code, keyCode, location) for named keys.
static NAMED_KEYS: phf::Map<&'static str, (&'static str, u32, u32)> = phf_map! {
    "Unidentified" => ("", 0, 0),
    "Cancel" => ("Abort", 3, 0),
    "Help" => ("Help", 6, 0),
    "Backspace" => ("Backspace", 8, 0),
    "Tab" => ("Tab", 9, 0),
    "Clear" => ("NumpadClear", 12, 3),
    "Return" => ("Enter", 13, 0),
    "Enter" => ("Enter", 13, 0),
    "Shift" => ("ShiftLeft", 16, 1),
    "Control" => ("ControlLeft", 17, 1),
    "Alt" => ("AltLeft", 18, 1),
    "Pause" => ("Pause", 19, 0),
    "CapsLock" => ("CapsLock", 20, 0),
    "Escape" => ("Escape", 27, 0),
    "PageUp" => ("PageUp", 33, 0),
    "PageDown" => ("PageDown", 34, 0),
    "End" => ("End", 35, 0),
    "Home" => ("Home", 36, 0),
    "ArrowLeft" => ("ArrowLeft", 37, 0),
    "ArrowUp" => ("ArrowUp", 38, 0),
    "ArrowRight" => ("ArrowRight", 39, 0),
    "ArrowDown" => ("ArrowDown", 40, 0),
    "Insert" => ("Insert", 45, 0),
    "Delete" => ("Delete", 46, 0),
    "Meta" => ("MetaLeft", 91, 1),
    "ZenkakuHankaku" => ("", 244, 0),
    "F1" => ("F1", 112, 0),
    "F2" => ("F2", 113, 0),
    "F3" => ("F3", 114, 0),
    "F4" => ("F4", 115, 0),
    "F5" => ("F5", 116, 0),
    "F6" => ("F6", 117, 0),
    "F7" => ("F7", 118, 0),
    "F8" => ("F8", 119, 0),
    "F9" => ("F9", 120, 0),
    "F10" => ("F10", 121, 0),
    "F11" => ("F11", 122, 0),
    "F12" => ("F12", 123, 0),
};

/// (code, keyCode) for printable non-alphanumeric US-layout keys, keyed by
/// the unshifted character.
static PRINTABLE_KEYS: phf::Map<char, (&'static str, u32)> = phf_map! {
    ' ' => ("Space", 32),
    ';' => ("Semicolon", 186),
    '=' => ("Equal", 187),
    ',' => ("Comma", 188),
    '-' => ("Minus", 189),
    '.' => ("Period", 190),
    '/' => ("Slash", 191),
    '`' => ("Backquote", 192),
    '[' => ("BracketLeft", 219),
    '\\' => ("Backslash", 220),
    ']' => ("BracketRight", 221),
    '\'' => ("Quote", 222),
};

/// Shifted variants on a US layout; both directions are derivable from this
/// single table.
static SHIFTED: phf::Map<char, char> = phf_map! {
    '1' => '!', '2' => '@', '3' => '#', '4' => '$', '5' => '%',
    '6' => '^', '7' => '&', '8' => '*', '9' => '(', '0' => ')',
    '`' => '~', '-' => '_', '=' => '+', '[' => '{', ']' => '}',
    '\\' => '|', ';' => ':', '\'' => '"', ',' => '<', '.' => '>',
    '/' => '?',
};

fn unshift(c: char) -> Option<char> {
    if c.is_ascii_uppercase() {
        return Some(c.to_ascii_lowercase());
    }
    SHIFTED
        .entries()
        .find(|(_, shifted)| **shifted == c)
        .map(|(unshifted, _)| *unshifted)
}

fn shift_char(c: char) -> Option<char> {
    if c.is_ascii_lowercase() {
        return Some(c.to_ascii_uppercase());
    }
    SHIFTED.get(&c).copied()
}

/// Resolve one `keyDown`/`keyUp` value. `shift_held` applies the layout's
/// shifted variant to the produced text.
pub fn resolve(raw: &str, shift_held: bool) -> Result<KeyInfo> {
    let mut chars = raw.chars();
    let (first, rest) = (chars.next(), chars.next());
    let c = match (first, rest) {
        (Some(c), None) => c,
        _ => {
            return Err(Error::invalid_argument(format!(
                "key value must be a single code point, got {raw:?}"
            )))
        }
    };

    if let Some(named) = webdriver_key(c) {
        let numpad = is_numpad_codepoint(c);
        let mut info = resolve_named(named, numpad, shift_held)?;
        // U+E050..U+E053 address the right-hand modifier variants
        if let Some(code) = right_modifier_code(c) {
            info.code = code.to_string();
            info.location = 2;
        }
        return Ok(info);
    }
    resolve_grapheme(c, shift_held)
}

fn resolve_named(named: &str, numpad: bool, shift_held: bool) -> Result<KeyInfo> {
    // numpad codepoints name printable keys; route them through the
    // grapheme path but with numpad location
    if named.chars().count() == 1 && !NAMED_KEYS.contains_key(named) {
        let c = named.chars().next().unwrap_or_default();
        let mut info = resolve_grapheme(c, shift_held)?;
        if numpad {
            info.location = 3;
            info.code = numpad_code(c).to_string();
        }
        return Ok(info);
    }
    let (code, key_code, location) = NAMED_KEYS
        .get(named)
        .copied()
        .ok_or_else(|| Error::invalid_argument(format!("unknown key: {named:?}")))?;
    let location = if numpad { 3 } else { location };
    let text = match named {
        "Enter" | "Return" => Some("\r".to_string()),
        _ => None,
    };
    Ok(KeyInfo {
        key: named.to_string(),
        code: code.to_string(),
        key_code,
        location,
        text: text.clone(),
        unmodified_text: text,
    })
}

fn resolve_grapheme(c: char, shift_held: bool) -> Result<KeyInfo> {
    let unshifted = unshift(c).unwrap_or(c);
    let effective = if shift_held {
        shift_char(unshifted).unwrap_or(c)
    } else {
        c
    };

    let (code, key_code) = if unshifted.is_ascii_lowercase() {
        let upper = unshifted.to_ascii_uppercase();
        (format!("Key{upper}"), upper as u32)
    } else if unshifted.is_ascii_digit() {
        (format!("Digit{unshifted}"), unshifted as u32)
    } else if let Some((code, key_code)) = PRINTABLE_KEYS.get(&unshifted).copied() {
        (code.to_string(), key_code)
    } else if !c.is_control() {
        // non-ascii grapheme: no physical code on the US layout
        (String::new(), 0)
    } else {
        return Err(Error::invalid_argument(format!(
            "invalid key grapheme: {c:?}"
        )));
    };

    Ok(KeyInfo {
        key: effective.to_string(),
        code,
        key_code,
        location: 0,
        text: Some(effective.to_string()),
        unmodified_text: Some(unshifted.to_string()),
    })
}

fn numpad_code(c: char) -> &'static str {
    match c {
        '0' => "Numpad0",
        '1' => "Numpad1",
        '2' => "Numpad2",
        '3' => "Numpad3",
        '4' => "Numpad4",
        '5' => "Numpad5",
        '6' => "Numpad6",
        '7' => "Numpad7",
        '8' => "Numpad8",
        '9' => "Numpad9",
        '*' => "NumpadMultiply",
        '+' => "NumpadAdd",
        ',' => "NumpadComma",
        '-' => "NumpadSubtract",
        '.' => "NumpadDecimal",
        '/' => "NumpadDivide",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn letters_resolve_with_shift() {
        let info = resolve("a", false).unwrap();
        assert_eq!(info.key, "a");
        assert_eq!(info.code, "KeyA");
        assert_eq!(info.key_code, 65);
        assert_eq!(info.text.as_deref(), Some("a"));

        let info = resolve("a", true).unwrap();
        assert_eq!(info.key, "A");
        assert_eq!(info.text.as_deref(), Some("A"));
        assert_eq!(info.unmodified_text.as_deref(), Some("a"));
    }

    #[test]
    fn shifted_punctuation_keeps_physical_key() {
        let info = resolve("!", false).unwrap();
        assert_eq!(info.code, "Digit1");
        assert_eq!(info.key_code, '1' as u32);
        assert_eq!(info.key, "!");
    }

    #[test]
    fn webdriver_codepoints_resolve_to_named_keys() {
        let info = resolve("\u{E007}", false).unwrap();
        assert_eq!(info.key, "Enter");
        assert_eq!(info.text.as_deref(), Some("\r"));

        let info = resolve("\u{E008}", false).unwrap();
        assert_eq!(info.key, "Shift");
        assert_eq!(info.location, 1);
        assert_eq!(modifier_bit(&info.key), Some(MODIFIER_SHIFT));
    }

    #[test]
    fn numpad_codepoints_use_numpad_location() {
        let info = resolve("\u{E01B}", false).unwrap();
        assert_eq!(info.key, "1");
        assert_eq!(info.location, 3);
        assert_eq!(info.code, "Numpad1");
        assert!(info.is_keypad());
    }

    #[test]
    fn multi_codepoint_values_are_invalid() {
        assert_eq!(resolve("ab", false).unwrap_err().code(), "invalid argument");
        assert_eq!(resolve("", false).unwrap_err().code(), "invalid argument");
    }
}
