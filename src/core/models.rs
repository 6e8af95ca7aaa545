use std::fmt;

use serde::{Deserialize, Serialize};

/// What a flashing run does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
pub enum OperationMode {
    /// Flash the right (central) half only, no reset image.
    #[value(name = "right-only")]
    #[serde(rename = "right-only")]
    UpdateRightOnly,
    /// Flash left then right, no reset image.
    #[value(name = "both")]
    #[serde(rename = "both")]
    UpdateBothWithoutReset,
    /// For each half: flash the reset image, then the half's image.
    #[value(name = "reset-both")]
    #[serde(rename = "reset-both")]
    ResetAndUpdateBoth,
}

impl OperationMode {
    pub fn description(&self) -> &'static str {
        match self {
            Self::UpdateRightOnly => "Update right (main) half only (without reset)",
            Self::UpdateBothWithoutReset => "Update both halves (without reset)",
            Self::ResetAndUpdateBoth => "Reset and update both halves",
        }
    }
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// One physical keyboard half.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Left => f.write_str("left"),
            Side::Right => f.write_str("right"),
        }
    }
}

/// What an image is flashed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageRole {
    Reset,
    Left,
    Right,
}

impl ImageRole {
    pub fn for_side(side: Side) -> Self {
        match side {
            Side::Left => ImageRole::Left,
            Side::Right => ImageRole::Right,
        }
    }
}

impl fmt::Display for ImageRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageRole::Reset => f.write_str("reset firmware"),
            ImageRole::Left => f.write_str("left keyboard"),
            ImageRole::Right => f.write_str("right keyboard"),
        }
    }
}
