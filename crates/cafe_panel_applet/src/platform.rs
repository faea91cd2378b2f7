/// The display server the current session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    X11,
    Wayland,
}

impl Platform {
    /// Detect the platform from the session environment.
    pub fn detect() -> Self {
        let session_type = std::env::var("XDG_SESSION_TYPE").unwrap_or_default();
        let wayland_display = std::env::var("WAYLAND_DISPLAY").unwrap_or_default();
        Self::from_env(&session_type, &wayland_display)
    }

    fn from_env(session_type: &str, wayland_display: &str) -> Self {
        if session_type.contains("wayland") || (!wayland_display.is_empty() && !session_type.contains("x11")) {
            Platform::Wayland
        } else {
            Platform::X11
        }
    }

    pub fn is_x11(self) -> bool {
        self == Platform::X11
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Platform::X11 => write!(f, "X11"),
            Platform::Wayland => write!(f, "Wayland"),
        }
    }
}

/// The screen number of `$DISPLAY` (`:0.1` is screen 1), 0 when unset or unparsable.
pub fn default_screen_number() -> i32 {
    std::env::var("DISPLAY").ok().and_then(|display| screen_number(&display)).unwrap_or(0)
}

fn screen_number(display: &str) -> Option<i32> {
    let (_, after_colon) = display.rsplit_once(':')?;
    match after_colon.split_once('.') {
        Some((_, screen)) => screen.parse().ok(),
        None => Some(0),
    }
}
