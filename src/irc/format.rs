//! mIRC formatting helpers: colors and bold.

pub const BOLD: char = '\x02';
pub const COLOR: char = '\x03';

pub const WHITE: u8 = 0;
pub const BLACK: u8 = 1;
pub const BLUE: u8 = 2;
pub const GREEN: u8 = 3;
pub const RED: u8 = 4;
pub const BROWN: u8 = 5;
pub const PURPLE: u8 = 6;
pub const ORANGE: u8 = 7;
pub const YELLOW: u8 = 8;
pub const LIGHTGREEN: u8 = 9;
pub const CYAN: u8 = 10;
pub const LIGHTCYAN: u8 = 11;
pub const LIGHTBLUE: u8 = 12;
pub const PINK: u8 = 13;
pub const GREY: u8 = 14;
pub const LIGHTGREY: u8 = 15;

// Semantic aliases used by the webhook formatters.
pub const COLOR_BRANCH: u8 = ORANGE;
pub const COLOR_REPO: u8 = GREY;
pub const COLOR_POSITIVE: u8 = GREEN;
pub const COLOR_NEGATIVE: u8 = RED;
pub const COLOR_NEUTRAL: u8 = LIGHTGREY;
pub const COLOR_ID: u8 = PINK;

/// Wrap `s` in a foreground color code.
pub fn color(s: &str, fg: u8) -> String {
    format!("{COLOR}{fg:02}{s}{COLOR}")
}

/// Wrap `s` in bold markers.
pub fn bold(s: &str) -> String {
    format!("{BOLD}{s}{BOLD}")
}
