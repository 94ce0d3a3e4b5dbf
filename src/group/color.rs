use std::fmt;
use std::str::FromStr;

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Group color, stored as a glyph prefix on the folder title
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Red,
    Orange,
    Yellow,
    Green,
    Blue,
    Purple,
}

impl Color {
    pub const ALL: [Color; 6] = [
        Color::Red,
        Color::Orange,
        Color::Yellow,
        Color::Green,
        Color::Blue,
        Color::Purple,
    ];

    pub fn glyph(self) -> &'static str {
        match self {
            Color::Red => "🔴",
            Color::Orange => "🟠",
            Color::Yellow => "🟡",
            Color::Green => "🟢",
            Color::Blue => "🔵",
            Color::Purple => "🟣",
        }
    }

    pub fn random() -> Self {
        *Self::ALL
            .choose(&mut rand::thread_rng())
            .unwrap_or(&Color::Blue)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Color::Red => "red",
            Color::Orange => "orange",
            Color::Yellow => "yellow",
            Color::Green => "green",
            Color::Blue => "blue",
            Color::Purple => "purple",
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Color {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| Error::InvalidInput(format!("unknown color: {s}")))
    }
}

/// Split a folder title into its color prefix and display name
pub fn parse_name(title: &str) -> (Option<Color>, &str) {
    for color in Color::ALL {
        if let Some(rest) = title.strip_prefix(color.glyph()) {
            return (Some(color), rest);
        }
    }
    (None, title)
}

pub fn format_name(color: Option<Color>, name: &str) -> String {
    match color {
        Some(c) => format!("{}{}", c.glyph(), name),
        None => name.to_string(),
    }
}
