//! Wire types of the daemon control protocol, shared by the server and
//! the client. Everything is JSON over HTTP.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

macro_rules! keyboard_keys {
    ($($variant:ident => $name:literal),+ $(,)?) => {
        /// Closed set of keys the daemon understands.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum KeyboardKey {
            $(#[serde(rename = $name)] $variant,)+
        }

        impl KeyboardKey {
            pub const ALL: &'static [KeyboardKey] = &[$(KeyboardKey::$variant,)+];

            pub fn as_str(self) -> &'static str {
                match self {
                    $(KeyboardKey::$variant => $name,)+
                }
            }
        }

        impl FromStr for KeyboardKey {
            type Err = UnknownKey;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok(KeyboardKey::$variant),)+
                    other => Err(UnknownKey(other.to_string())),
                }
            }
        }
    };
}

keyboard_keys! {
    Enter => "enter", Tab => "tab", Space => "space", Backspace => "backspace",
    Delete => "delete", Escape => "escape", Home => "home", End => "end",
    PageUp => "pageup", PageDown => "pagedown",
    Up => "up", Down => "down", Left => "left", Right => "right",
    Shift => "shift", Ctrl => "ctrl", LCtrl => "lctrl", RCtrl => "rctrl",
    Alt => "alt", LAlt => "lalt", RAlt => "ralt",
    Meta => "meta", LMeta => "lmeta", RMeta => "rmeta",
    F1 => "f1", F2 => "f2", F3 => "f3", F4 => "f4", F5 => "f5", F6 => "f6",
    F7 => "f7", F8 => "f8", F9 => "f9", F10 => "f10", F11 => "f11", F12 => "f12",
    A => "a", B => "b", C => "c", D => "d", E => "e", F => "f", G => "g",
    H => "h", I => "i", J => "j", K => "k", L => "l", M => "m", N => "n",
    O => "o", P => "p", Q => "q", R => "r", S => "s", T => "t", U => "u",
    V => "v", W => "w", X => "x", Y => "y", Z => "z",
    Num0 => "0", Num1 => "1", Num2 => "2", Num3 => "3", Num4 => "4",
    Num5 => "5", Num6 => "6", Num7 => "7", Num8 => "8", Num9 => "9",
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown keyboard key `{0}`")]
pub struct UnknownKey(pub String);

impl fmt::Display for KeyboardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

// ── Actions ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandAction {
    pub command: String,
    /// Seconds. `None` lets the command run to completion.
    #[serde(default)]
    pub timeout: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyDownAction {
    pub key: KeyboardKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyUpAction {
    pub key: KeyboardKey,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyPressAction {
    pub key: KeyboardKey,
    #[serde(default = "default_press_duration")]
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotkeyAction {
    pub keys: Vec<KeyboardKey>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeAction {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseMoveAction {
    pub x: i32,
    pub y: i32,
    #[serde(default = "default_move_duration")]
    pub move_duration: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MouseScrollAction {
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MouseButtonAction {
    #[serde(default)]
    pub button: MouseButton,
}

fn default_press_duration() -> f64 {
    0.1
}

fn default_move_duration() -> f64 {
    0.5
}

/// Every action the daemon dispatches to its computer.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Command(CommandAction),
    KeyDown(KeyDownAction),
    KeyUp(KeyUpAction),
    KeyPress(KeyPressAction),
    Hotkey(HotkeyAction),
    Type(TypeAction),
    MouseMove(MouseMoveAction),
    MouseScroll(MouseScrollAction),
    MouseDown(MouseButtonAction),
    MouseUp(MouseButtonAction),
}

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Command(_) => "command",
            Self::KeyDown(_) => "keyboard_key_down",
            Self::KeyUp(_) => "keyboard_key_up",
            Self::KeyPress(_) => "keyboard_key_press",
            Self::Hotkey(_) => "keyboard_hotkey",
            Self::Type(_) => "type",
            Self::MouseMove(_) => "mouse_move",
            Self::MouseScroll(_) => "mouse_scroll",
            Self::MouseDown(_) => "mouse_button_down",
            Self::MouseUp(_) => "mouse_button_up",
        }
    }
}

/// Response body of every action and side-channel endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub message: String,
}

impl ActionResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

// ── Observations ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenshotObservation {
    /// Base64-encoded image.
    pub screenshot: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MouseStateObservation {
    pub buttons: BTreeMap<MouseButton, bool>,
    pub position: (i32, i32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyboardStateObservation {
    pub keys: BTreeMap<KeyboardKey, bool>,
}

/// All observations in one payload; a part the computer cannot provide is `null`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub screenshot: Option<ScreenshotObservation>,
    #[serde(default)]
    pub mouse_state: Option<MouseStateObservation>,
    #[serde(default)]
    pub keyboard_state: Option<KeyboardStateObservation>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_lowercase_wire_names() {
        assert_eq!(serde_json::to_string(&KeyboardKey::PageUp).unwrap(), "\"pageup\"");
        assert_eq!(serde_json::to_string(&KeyboardKey::Num7).unwrap(), "\"7\"");
        assert_eq!("lctrl".parse::<KeyboardKey>().unwrap(), KeyboardKey::LCtrl);
        assert!("hyper".parse::<KeyboardKey>().is_err());
        assert_eq!(KeyboardKey::ALL.len(), 24 + 12 + 26 + 10);
    }

    #[test]
    fn every_key_round_trips_through_its_name() {
        for key in KeyboardKey::ALL {
            assert_eq!(key.as_str().parse::<KeyboardKey>().unwrap(), *key);
        }
    }

    #[test]
    fn action_defaults_apply() {
        let press: KeyPressAction = serde_json::from_str(r#"{"key":"enter"}"#).unwrap();
        assert_eq!(press.duration, 0.1);
        let mv: MouseMoveAction = serde_json::from_str(r#"{"x":10,"y":20}"#).unwrap();
        assert_eq!(mv.move_duration, 0.5);
        let down: MouseButtonAction = serde_json::from_str("{}").unwrap();
        assert_eq!(down.button, MouseButton::Left);
        let cmd: CommandAction = serde_json::from_str(r#"{"command":"ls"}"#).unwrap();
        assert_eq!(cmd.timeout, None);
    }

    #[test]
    fn unknown_key_is_rejected_on_the_wire() {
        let result: Result<KeyDownAction, _> = serde_json::from_str(r#"{"key":"hyper"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn mouse_state_serializes_buttons_as_map() {
        let state = MouseStateObservation {
            buttons: BTreeMap::from([(MouseButton::Left, true), (MouseButton::Right, false)]),
            position: (5, 6),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["buttons"]["left"], true);
        assert_eq!(json["position"], serde_json::json!([5, 6]));
    }
}
