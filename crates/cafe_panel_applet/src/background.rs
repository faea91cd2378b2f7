use std::{fmt, str::FromStr};

/// An RGBA color with channels in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rgba {
    pub red: f64,
    pub green: f64,
    pub blue: f64,
    pub alpha: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackgroundParseError {
    #[error("unknown background type {0:?}")]
    UnknownType(String),
    #[error("invalid color {0:?}")]
    InvalidColor(String),
    #[error("invalid pixmap descriptor {0:?}, expected <xid>,<x>,<y>")]
    InvalidPixmap(String),
}

impl Rgba {
    pub const fn new(red: f64, green: f64, blue: f64, alpha: f64) -> Self {
        Rgba { red, green, blue, alpha }
    }

    fn parse_hex(hex: &str) -> Option<Self> {
        if !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let digits = match hex.len() {
            3 | 6 | 9 | 12 => hex.len() / 3,
            _ => return None,
        };
        let max = (16u32.pow(digits as u32) - 1) as f64;
        let channel = |i: usize| u32::from_str_radix(&hex[i * digits..(i + 1) * digits], 16).ok().map(|v| v as f64 / max);
        Some(Rgba::new(channel(0)?, channel(1)?, channel(2)?, 1.0))
    }

    fn parse_function(s: &str) -> Option<Self> {
        let (args, has_alpha) = if let Some(args) = s.strip_prefix("rgba(") {
            (args, true)
        } else {
            (s.strip_prefix("rgb(")?, false)
        };
        let args: Vec<&str> = args.strip_suffix(')')?.split(',').map(str::trim).collect();
        if args.len() != if has_alpha { 4 } else { 3 } {
            return None;
        }

        let channel = |arg: &str| -> Option<f64> {
            let value = if let Some(percent) = arg.strip_suffix('%') {
                percent.trim().parse::<f64>().ok()? / 100.0
            } else {
                arg.parse::<f64>().ok()? / 255.0
            };
            Some(value.clamp(0.0, 1.0))
        };
        let alpha = if has_alpha { args[3].parse::<f64>().ok()?.clamp(0.0, 1.0) } else { 1.0 };
        Some(Rgba::new(channel(args[0])?, channel(args[1])?, channel(args[2])?, alpha))
    }
}

impl FromStr for Rgba {
    type Err = BackgroundParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parsed = match trimmed.strip_prefix('#') {
            Some(hex) => Rgba::parse_hex(hex),
            None => Rgba::parse_function(trimmed),
        };
        parsed.ok_or_else(|| BackgroundParseError::InvalidColor(s.to_string()))
    }
}

impl fmt::Display for Rgba {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let to_byte = |c: f64| (c * 255.0).round() as u8;
        if self.alpha >= 1.0 {
            write!(f, "rgb({},{},{})", to_byte(self.red), to_byte(self.green), to_byte(self.blue))
        } else {
            write!(f, "rgba({},{},{},{})", to_byte(self.red), to_byte(self.green), to_byte(self.blue), self.alpha)
        }
    }
}

/// Background the panel paints behind an applet.
///
/// On the wire this is a string: `none`, `color:<color>` or `pixmap:<xid>,<x>,<y>`, where the
/// pixmap is a foreign X11 pixmap and `x`/`y` is the applet's offset into it.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Background {
    #[default]
    None,
    Color(Rgba),
    Pixmap { xid: u32, x: i32, y: i32 },
}

impl Background {
    /// Decode a background descriptor, falling back to [`Background::None`] when it is malformed.
    pub fn decode_lossy(descriptor: &str) -> Self {
        match descriptor.parse() {
            Ok(background) => background,
            Err(e) => {
                log::warn!("Ignoring applet background {:?}: {}", descriptor, e);
                Background::None
            }
        }
    }
}

impl FromStr for Background {
    type Err = BackgroundParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() || s == "none" {
            return Ok(Background::None);
        }

        let Some((kind, value)) = s.split_once(':') else {
            return Err(BackgroundParseError::UnknownType(s.to_string()));
        };
        match kind {
            "color" => Ok(Background::Color(value.parse()?)),
            "pixmap" => {
                let invalid = || BackgroundParseError::InvalidPixmap(value.to_string());
                let parts: Vec<&str> = value.split(',').collect();
                let [xid, x, y] = parts[..] else {
                    return Err(invalid());
                };
                Ok(Background::Pixmap {
                    xid: xid.trim().parse().map_err(|_| invalid())?,
                    x: x.trim().parse().map_err(|_| invalid())?,
                    y: y.trim().parse().map_err(|_| invalid())?,
                })
            }
            other => Err(BackgroundParseError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for Background {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Background::None => write!(f, "none"),
            Background::Color(color) => write!(f, "color:{}", color),
            Background::Pixmap { xid, x, y } => write!(f, "pixmap:{},{},{}", xid, x, y),
        }
    }
}
