use std::fmt;

use crate::error::{CaptureError, Result};

const NAMED_KEYS: &[(&str, u16)] = &[
    ("ctrl", 0x11),
    ("shift", 0x10),
    ("alt", 0x12),
    ("win", 0x5B),
    ("space", 0x20),
    ("enter", 0x0D),
    ("tab", 0x09),
    ("esc", 0x1B),
    ("backspace", 0x08),
    ("insert", 0x2D),
    ("delete", 0x2E),
    ("home", 0x24),
    ("end", 0x23),
    ("pageup", 0x21),
    ("pagedown", 0x22),
    ("printscreen", 0x2C),
    ("pause", 0x13),
];

fn alias(name: &str) -> &str {
    match name {
        "control" => "ctrl",
        "menu" => "alt",
        "escape" => "esc",
        "return" => "enter",
        "super" | "meta" => "win",
        "pgup" => "pageup",
        "pgdn" => "pagedown",
        "prtsc" => "printscreen",
        other => other,
    }
}

/// Virtual-key code for a lowercase key name.
#[must_use]
pub fn virtual_key(name: &str) -> Option<u16> {
    let name = alias(name);
    if let Some((_, vk)) = NAMED_KEYS.iter().find(|(key, _)| *key == name) {
        return Some(*vk);
    }
    if let Some(number) = name.strip_prefix('f') {
        if let Ok(index) = number.parse::<u16>() {
            if (1..=24).contains(&index) {
                return Some(0x70 + index - 1);
            }
        }
    }
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(ch), None) if ch.is_ascii_lowercase() => Some(ch.to_ascii_uppercase() as u16),
        (Some(ch), None) if ch.is_ascii_digit() => Some(ch as u16),
        _ => None,
    }
}

#[must_use]
pub fn is_modifier(name: &str) -> bool {
    matches!(alias(name), "ctrl" | "shift" | "alt" | "win")
}

/// A chord such as `alt+f9`: modifiers are pressed in order, then released in
/// reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyCombo {
    keys: Vec<String>,
}

impl KeyCombo {
    pub fn parse(raw: &str) -> Result<Self> {
        let keys = raw
            .split('+')
            .map(|part| alias(&part.trim().to_ascii_lowercase()).to_string())
            .collect::<Vec<_>>();
        if keys.iter().any(String::is_empty) {
            return Err(CaptureError::invalid(format!("malformed key combo: {raw:?}")));
        }
        if let Some(unknown) = keys.iter().find(|key| virtual_key(key).is_none()) {
            return Err(CaptureError::invalid(format!(
                "unknown key {unknown:?} in combo {raw:?}"
            )));
        }
        Ok(Self { keys })
    }

    #[must_use]
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    #[must_use]
    pub fn virtual_keys(&self) -> Vec<u16> {
        self.keys.iter().filter_map(|key| virtual_key(key)).collect()
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.keys.join("+"))
    }
}

#[cfg(test)]
mod tests {
    use super::{is_modifier, virtual_key, KeyCombo};

    #[test]
    fn parses_modifiers_and_function_keys() {
        let combo = KeyCombo::parse("Alt + F9").expect("combo");
        assert_eq!(combo.keys(), ["alt", "f9"]);
        assert_eq!(combo.virtual_keys(), vec![0x12, 0x78]);
        assert_eq!(combo.to_string(), "alt+f9");
    }

    #[test]
    fn aliases_normalize() {
        let combo = KeyCombo::parse("control+escape").expect("combo");
        assert_eq!(combo.keys(), ["ctrl", "esc"]);
        assert!(is_modifier("control"));
        assert!(!is_modifier("f9"));
    }

    #[test]
    fn letters_and_digits_map_to_ascii_codes() {
        assert_eq!(virtual_key("r"), Some(0x52));
        assert_eq!(virtual_key("7"), Some(0x37));
        assert_eq!(virtual_key("f24"), Some(0x87));
        assert_eq!(virtual_key("f25"), None);
    }

    #[test]
    fn rejects_unknown_and_empty_keys() {
        let unknown = KeyCombo::parse("ctrl+banana").expect_err("unknown key");
        assert!(unknown.to_string().contains("banana"));
        assert!(KeyCombo::parse("ctrl++r").is_err());
    }
}
