//! Three-stop color gradient used to colorize gauge widgets.

use std::fmt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ColorParseError {
    #[error("color '{0}' is not in #RRGGBB form")]
    BadFormat(String),
}

/// An RGB color parsed from and rendered as `#RRGGBB`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Color {
    pub fn from_rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    pub fn parse(s: &str) -> Result<Self, ColorParseError> {
        let hex = s
            .strip_prefix('#')
            .filter(|h| h.len() == 6)
            .ok_or_else(|| ColorParseError::BadFormat(s.to_string()))?;

        let byte = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&hex[range], 16)
                .map_err(|_| ColorParseError::BadFormat(s.to_string()))
        };

        Ok(Self {
            r: byte(0..2)?,
            g: byte(2..4)?,
            b: byte(4..6)?,
        })
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

fn channel_interp(start: u8, end: u8, t: f64) -> u8 {
    let delta = (end as f64 - start as f64) * t;
    (start as f64 + delta.round()).clamp(0.0, 255.0) as u8
}

fn color_interp(start: Color, end: Color, t: f64) -> Color {
    Color {
        r: channel_interp(start.r, end.r, t),
        g: channel_interp(start.g, end.g, t),
        b: channel_interp(start.b, end.b, t),
    }
}

/// Low -> mid -> high gradient with a configurable midpoint position.
///
/// The midpoint position is a percentage clamped to (0, 100]: values at or
/// below zero become 0.1 and values at or above 100 become 100, keeping both
/// interpolation denominators nonzero. Query percentages are clamped to
/// [0, 100], so `color_at(0.0)` is exactly the low color and
/// `color_at(100.0)` exactly the high one.
#[derive(Debug, Clone, Copy, Default)]
pub struct Gradient3 {
    color0: Color,
    color_n: Color,
    color100: Color,
    mid: f64,
}

impl Gradient3 {
    pub fn new(color0: Color, color_n: Color, color100: Color, mid_percent: f64) -> Self {
        let mid = if mid_percent <= 0.0 {
            0.1
        } else if mid_percent >= 100.0 {
            100.0
        } else {
            mid_percent
        };
        Self {
            color0,
            color_n,
            color100,
            mid,
        }
    }

    pub fn color_at(&self, percent: f64) -> Color {
        let p = percent.clamp(0.0, 100.0);
        if p < self.mid {
            color_interp(self.color0, self.color_n, p / self.mid)
        } else if p == self.mid {
            self.color_n
        } else {
            color_interp(self.color_n, self.color100, (p - self.mid) / (100.0 - self.mid))
        }
    }
}
