//! Response classification
//!
//! A reply ends in the responding pump's two-digit address followed by a
//! status glyph. `OOR` anywhere in the reply rejects the last numeric
//! parameter.

use super::format::parse_number;

/// Glyphs a well-formed acknowledgment may end with
pub const STATUS_GLYPHS: &str = ":<>*IWDT";

/// Glyphs accepted as the reply to `STP`
pub const STOP_GLYPHS: &str = ":*IWDT";

/// Out-of-range token
pub const OUT_OF_RANGE: &str = "OOR";

/// Pump status reported by the trailing glyph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// `:` idle or halted
    Idle,
    /// `>` infusing
    Infusing,
    /// `<` withdrawing
    Withdrawing,
    /// `*` stalled
    Stalled,
    /// `I`, `W`, `D` or `T`: pump-specific alarm flags
    Flag(char),
}

impl Status {
    /// Decode a glyph, `None` if it is not a status glyph
    pub fn from_glyph(c: char) -> Option<Status> {
        match c {
            ':' => Some(Status::Idle),
            '>' => Some(Status::Infusing),
            '<' => Some(Status::Withdrawing),
            '*' => Some(Status::Stalled),
            'I' | 'W' | 'D' | 'T' => Some(Status::Flag(c)),
            _ => None,
        }
    }

    /// Glyph as sent by the firmware
    pub fn glyph(&self) -> char {
        match self {
            Status::Idle => ':',
            Status::Infusing => '>',
            Status::Withdrawing => '<',
            Status::Stalled => '*',
            Status::Flag(c) => *c,
        }
    }
}

/// How a reply to a parameter command should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Well-formed acknowledgment
    Ack(Status),
    /// Firmware rejected the parameter
    OutOfRange,
    /// Anything else
    Unrecognized,
}

/// Classify a decoded, trimmed reply
pub fn classify(resp: &str) -> Reply {
    if resp.contains(OUT_OF_RANGE) {
        return Reply::OutOfRange;
    }
    if let Some(status) = resp.chars().last().and_then(Status::from_glyph) {
        return Reply::Ack(status);
    }
    if resp.contains('*') {
        return Reply::Ack(Status::Stalled);
    }
    Reply::Unrecognized
}

/// Whether the reply shows the pump in motion in either direction
pub fn is_moving(resp: &str) -> bool {
    resp.contains('<') || resp.contains('>')
}

/// Whether the reply acknowledges a stop request. An empty reply does not.
pub fn is_stop_ack(resp: &str) -> bool {
    resp.chars().last().is_some_and(|c| STOP_GLYPHS.contains(c))
}

/// Address encoded in the two characters before the trailing glyph
pub fn responder_address(resp: &str) -> Option<u8> {
    let chars: Vec<char> = resp.chars().collect();
    if chars.len() < 3 {
        return None;
    }
    let digits: String = chars[chars.len() - 3..chars.len() - 1].iter().collect();
    digits.trim().parse::<u8>().ok()
}

/// First space-delimited token of a readback reply, as a number
pub fn leading_number(resp: &str) -> Option<f64> {
    resp.split_whitespace().next().and_then(parse_number)
}

/// First space-delimited token of a readback reply, as text
pub fn leading_token(resp: &str) -> Option<&str> {
    resp.split_whitespace().next()
}
