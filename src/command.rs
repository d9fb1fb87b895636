//! Pixel addressing language.
//!
//! Translates a mapping of address specs (`"all"`, `"5"`, `"1-10"`) to hex
//! colors (`"#00ff00"`) into validated [`ColorCommand`]s. A batch is either
//! parsed completely or rejected on the first malformed entry.

use std::fmt;
use std::ops::Range;

use serde_json::{Map, Value};
use thiserror::Error;

/// Error returned for malformed command batches.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{0}")]
    InvalidCommand(String),
}

impl CommandError {
    fn invalid(message: &str) -> Self {
        Self::InvalidCommand(message.to_string())
    }
}

const INVALID_COLOR: &str = "Invalid color format.";
const INVALID_SPEC: &str = "Invalid color format";
const INVALID_RANGE: &str = "Invalid range format";

/// Target selector for the pixel buffer.
///
/// Indices are 0-based. `Range` is half-open: `Range(0, 10)` covers pixels
/// `0..10`. The parser does not enforce `end >= start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpec {
    All,
    Single(usize),
    Range(usize, usize),
}

impl AddressSpec {
    /// Pixel indices this spec covers on a strip of `len` pixels.
    ///
    /// Ranges running past the end are clipped. Empty or inverted ranges and
    /// specs starting beyond the strip are rejected.
    pub fn resolve(self, len: usize) -> Result<Range<usize>, CommandError> {
        let (start, end) = match self {
            AddressSpec::All => return Ok(0..len),
            AddressSpec::Single(index) => (index, index.saturating_add(1)),
            AddressSpec::Range(start, end) => (start, end),
        };
        if end <= start || start >= len {
            return Err(CommandError::invalid(INVALID_RANGE));
        }
        Ok(start..end.min(len))
    }
}

/// Raw 4-byte color, most significant byte first.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color(pub u32);

impl Color {
    /// Channel bytes in big-endian order.
    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub const fn from_bytes(bytes: [u8; 4]) -> Self {
        Self(u32::from_be_bytes(bytes))
    }

    /// Decodes a hex string, with or without a leading `#`.
    pub fn from_hex(hex: &str) -> Result<Self, CommandError> {
        let digits = hex.strip_prefix('#').unwrap_or(hex);
        // from_str_radix accepts a leading '+', the color grammar does not
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CommandError::invalid(INVALID_COLOR));
        }
        u32::from_str_radix(digits, 16)
            .map(Self)
            .map_err(|_| CommandError::invalid(INVALID_COLOR))
    }
}

impl fmt::Debug for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Color({:#010x})", self.0)
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:08x}", self.0)
    }
}

/// One parsed `(address, color)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorCommand {
    pub address: AddressSpec,
    pub color: Color,
}

/// Parses a batch of `(address spec, hex color)` entries.
///
/// Order of the returned commands follows the iteration order of `entries`.
///
/// # Example
///
/// ```
/// use neopixeld::command::{parse_commands, AddressSpec, Color};
///
/// let parsed = parse_commands([("1-10", "#ff0000")]).unwrap();
/// assert_eq!(parsed[0].address, AddressSpec::Range(0, 10));
/// assert_eq!(parsed[0].color, Color(0x00ff_0000));
/// ```
pub fn parse_commands<I, K, V>(entries: I) -> Result<Vec<ColorCommand>, CommandError>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: AsRef<str>,
{
    entries
        .into_iter()
        .map(|(leds, hex)| parse_entry(leds.as_ref(), hex.as_ref()))
        .collect()
}

/// Parses a JSON object body. Non-string values are rejected.
pub fn parse_json_commands(body: &Map<String, Value>) -> Result<Vec<ColorCommand>, CommandError> {
    body.iter()
        .map(|(leds, value)| match value {
            Value::String(hex) => parse_entry(leds, hex),
            _ => Err(CommandError::invalid(INVALID_COLOR)),
        })
        .collect()
}

fn parse_entry(leds: &str, hex: &str) -> Result<ColorCommand, CommandError> {
    let color = Color::from_hex(hex)?;

    if leds.eq_ignore_ascii_case("all") {
        return Ok(ColorCommand {
            address: AddressSpec::All,
            color,
        });
    }

    let (first, last) = if leds.contains('-') {
        let parts: Vec<&str> = leds.split('-').collect();
        match parts.as_slice() {
            [first, last] => (parse_index(first)?, parse_index(last)?),
            _ => return Err(CommandError::invalid(INVALID_RANGE)),
        }
    } else if is_digits(leds) {
        let index = parse_index(leds)?;
        (index, index)
    } else {
        return Err(CommandError::invalid(INVALID_SPEC));
    };

    if first < 1 {
        return Err(CommandError::invalid(INVALID_RANGE));
    }

    Ok(ColorCommand {
        address: AddressSpec::Range(first - 1, last),
        color,
    })
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

fn parse_index(s: &str) -> Result<usize, CommandError> {
    if !is_digits(s) {
        return Err(CommandError::invalid(INVALID_RANGE));
    }
    s.parse().map_err(|_| CommandError::invalid(INVALID_RANGE))
}
