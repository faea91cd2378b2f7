use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Edge of the screen the panel hosting an applet is attached to, as seen from the applet.
///
/// `Up` means the panel is at the bottom of the screen and menus should pop up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    #[default]
    Up,
    Down,
    Left,
    Right,
}

impl Orientation {
    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Orientation::Up),
            1 => Ok(Orientation::Down),
            2 => Ok(Orientation::Left),
            3 => Ok(Orientation::Right),
            x => Err(Error::InvalidOrientation(x)),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Orientation::Up => 0,
            Orientation::Down => 1,
            Orientation::Left => 2,
            Orientation::Right => 3,
        }
    }

    /// Whether the panel runs horizontally along the screen edge.
    pub fn is_horizontal(self) -> bool {
        matches!(self, Orientation::Up | Orientation::Down)
    }
}

impl std::str::FromStr for Orientation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "up" => Ok(Orientation::Up),
            "down" => Ok(Orientation::Down),
            "left" => Ok(Orientation::Left),
            "right" => Ok(Orientation::Right),
            _ => Err(Error::InvalidOrientationName(s.to_string())),
        }
    }
}

impl std::fmt::Display for Orientation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Orientation::Up => "up",
            Orientation::Down => "down",
            Orientation::Left => "left",
            Orientation::Right => "right",
        };
        write!(f, "{}", s)
    }
}

bitflags::bitflags! {
    /// Layout requests an applet makes to the panel.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AppletFlags: u32 {
        const EXPAND_MAJOR = 1 << 0;
        const EXPAND_MINOR = 1 << 1;
        const HAS_HANDLE = 1 << 2;
    }
}

/// Sizes an applet is happy with along the panel, as a flat list of `(max, min)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SizeHints(Vec<i32>);

impl SizeHints {
    pub fn new(hints: Vec<i32>) -> Result<Self> {
        if hints.len() % 2 != 0 {
            return Err(Error::OddSizeHints(hints.len()));
        }
        Ok(SizeHints(hints))
    }

    /// Build hints relative to `base_size`, which is added to every element.
    pub fn with_base_size(hints: &[i32], base_size: i32) -> Result<Self> {
        Self::new(hints.iter().map(|hint| hint.saturating_add(base_size)).collect())
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The `(max, min)` ranges, in order of preference.
    pub fn ranges(&self) -> impl Iterator<Item = (i32, i32)> + '_ {
        self.0.chunks_exact(2).map(|pair| (pair[0], pair[1]))
    }
}

impl From<SizeHints> for Vec<i32> {
    fn from(hints: SizeHints) -> Self {
        hints.0
    }
}
