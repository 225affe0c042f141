use std::fmt;

use crate::error::{BridgeError, Result};

/// Input device class passed to `input <source> ...`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputSource {
    /// Let the `input` tool pick; no source token is emitted.
    #[default]
    Default,
    Dpad,
    Keyboard,
    Mouse,
    Touchpad,
    Gamepad,
    TouchNavigation,
    Joystick,
    Touchscreen,
    Stylus,
    Trackball,
}

impl InputSource {
    pub fn as_str(self) -> &'static str {
        match self {
            InputSource::Default => "default",
            InputSource::Dpad => "dpad",
            InputSource::Keyboard => "keyboard",
            InputSource::Mouse => "mouse",
            InputSource::Touchpad => "touchpad",
            InputSource::Gamepad => "gamepad",
            InputSource::TouchNavigation => "touchnavigation",
            InputSource::Joystick => "joystick",
            InputSource::Touchscreen => "touchscreen",
            InputSource::Stylus => "stylus",
            InputSource::Trackball => "trackball",
        }
    }
}

impl fmt::Display for InputSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPress {
    Long,
    Double,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionAction {
    Down,
    Up,
    Move,
    Cancel,
}

impl MotionAction {
    fn as_str(self) -> &'static str {
        match self {
            MotionAction::Down => "DOWN",
            MotionAction::Up => "UP",
            MotionAction::Move => "MOVE",
            MotionAction::Cancel => "CANCEL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Text(String),
    KeyEvent { press: Option<KeyPress>, codes: Vec<u32> },
    Tap { x: i32, y: i32 },
    Swipe { from: (i32, i32), to: (i32, i32), duration_ms: Option<u32> },
    DragAndDrop { from: (i32, i32), to: (i32, i32), duration_ms: Option<u32> },
    Press,
    Roll { dx: i32, dy: i32 },
    MotionEvent { action: MotionAction, x: i32, y: i32 },
    KeyCombination(Vec<String>),
}

/// A validated `input` invocation. Constructors reject argument sets the tool would refuse,
/// so a built command can always be sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputCommand(Command);

impl InputCommand {
    /// Types `text`. Spaces are encoded as `%s`, which is what `input text` expects.
    pub fn text(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Err(BridgeError::InvalidArgument("input text must not be empty".into()));
        }
        Ok(Self(Command::Text(text.replace(' ', "%s"))))
    }

    pub fn key_event(press: Option<KeyPress>, codes: &[u32]) -> Result<Self> {
        if codes.is_empty() {
            return Err(BridgeError::InvalidArgument("keyevent needs at least one key code".into()));
        }
        Ok(Self(Command::KeyEvent { press, codes: codes.to_vec() }))
    }

    pub fn tap(x: i32, y: i32) -> Self {
        Self(Command::Tap { x, y })
    }

    pub fn swipe(from: (i32, i32), to: (i32, i32), duration_ms: Option<u32>) -> Self {
        Self(Command::Swipe { from, to, duration_ms })
    }

    pub fn drag_and_drop(from: (i32, i32), to: (i32, i32), duration_ms: Option<u32>) -> Self {
        Self(Command::DragAndDrop { from, to, duration_ms })
    }

    pub fn press() -> Self {
        Self(Command::Press)
    }

    pub fn roll(dx: i32, dy: i32) -> Self {
        Self(Command::Roll { dx, dy })
    }

    pub fn motion_event(action: MotionAction, x: i32, y: i32) -> Self {
        Self(Command::MotionEvent { action, x, y })
    }

    /// Presses `keys` (key names such as `KEYCODE_CTRL_LEFT`) together.
    pub fn key_combination<S: AsRef<str>>(keys: &[S]) -> Result<Self> {
        if keys.is_empty() {
            return Err(BridgeError::InvalidArgument(
                "keycombination needs at least one key".into(),
            ));
        }
        let keys = keys
            .iter()
            .map(|k| {
                let k = k.as_ref();
                if k.is_empty() || k.contains(char::is_whitespace) {
                    Err(BridgeError::InvalidArgument(format!("invalid key name {k:?}")))
                } else {
                    Ok(k.to_string())
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self(Command::KeyCombination(keys)))
    }

    pub fn name(&self) -> &'static str {
        match &self.0 {
            Command::Text(_) => "text",
            Command::KeyEvent { .. } => "keyevent",
            Command::Tap { .. } => "tap",
            Command::Swipe { .. } => "swipe",
            Command::DragAndDrop { .. } => "draganddrop",
            Command::Press => "press",
            Command::Roll { .. } => "roll",
            Command::MotionEvent { .. } => "motionevent",
            Command::KeyCombination(_) => "keycombination",
        }
    }

    /// Arguments following the command name.
    pub fn args(&self) -> Vec<String> {
        fn stroke(from: (i32, i32), to: (i32, i32), duration_ms: Option<u32>) -> Vec<String> {
            let mut args =
                vec![from.0.to_string(), from.1.to_string(), to.0.to_string(), to.1.to_string()];
            args.extend(duration_ms.map(|d| d.to_string()));
            args
        }

        match &self.0 {
            Command::Text(text) => vec![text.clone()],
            Command::KeyEvent { press, codes } => {
                let flag = press.map(|p| match p {
                    KeyPress::Long => "--longpress".to_string(),
                    KeyPress::Double => "--doubletap".to_string(),
                });
                flag.into_iter().chain(codes.iter().map(u32::to_string)).collect()
            }
            Command::Tap { x, y } => vec![x.to_string(), y.to_string()],
            Command::Swipe { from, to, duration_ms }
            | Command::DragAndDrop { from, to, duration_ms } => stroke(*from, *to, *duration_ms),
            Command::Press => Vec::new(),
            Command::Roll { dx, dy } => vec![dx.to_string(), dy.to_string()],
            Command::MotionEvent { action, x, y } => {
                vec![action.as_str().to_string(), x.to_string(), y.to_string()]
            }
            Command::KeyCombination(keys) => keys.clone(),
        }
    }

    /// Full argument list for the `input` tool, including the source token.
    pub fn to_shell_args(&self, source: InputSource) -> Vec<String> {
        let mut args = Vec::new();
        if source != InputSource::Default {
            args.push(source.as_str().to_string());
        }
        args.push(self.name().to_string());
        args.extend(self.args());
        args
    }
}
