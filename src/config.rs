use serde_derive::{Deserialize, Serialize};
use std::{
    fs,
    ops::{Range, RangeInclusive},
    path::{Path, PathBuf},
};

use crate::{
    diag::{Error, Result},
    status::{PtResult, Status},
};

/// Decoder configuration for one session.
///
/// `begin` and `end` restrict decoding to a byte range of the trace. An `end`
/// of zero means "up to the end of the trace". Offsets reported by the
/// session stay absolute, i.e. relative to the start of the whole trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub begin: u64,
    pub end: u64,
}

impl Config {
    #[must_use]
    pub fn new(begin: u64, end: u64) -> Self {
        Self { begin, end }
    }

    /// Parses a JSON configuration such as `{"begin": 4096, "end": 0}`.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if `text` is not a valid configuration.
    pub fn from_json(text: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(Error::from(format!("expected a JSON object, got `{text}`")));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read_to_string(path)?)
    }

    /// The byte range of a `size`-byte trace this configuration selects.
    ///
    /// # Errors
    ///
    /// Returns `Status::BadConfig` if the range does not fit the trace or is
    /// empty while an explicit `end` was given.
    pub fn range(&self, size: usize) -> PtResult<Range<usize>> {
        let begin = usize::try_from(self.begin).map_err(|_| Status::BadConfig)?;
        let end = if self.end == 0 {
            size
        } else {
            usize::try_from(self.end).map_err(|_| Status::BadConfig)?
        };

        if begin > size || end > size || begin > end || (self.end != 0 && begin == end) {
            return Err(Status::BadConfig);
        }
        Ok(begin..end)
    }
}

/// Parses a decimal or `0x`-prefixed hexadecimal number.
///
/// # Errors
///
/// Returns a message suitable for command-line diagnostics.
pub fn parse_number(text: &str) -> std::result::Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("invalid number `{text}`: {err}"))
}

/// Parses `PATH@ADDRESS`.
///
/// # Errors
///
/// Returns a message suitable for command-line diagnostics.
pub fn parse_placement(text: &str) -> std::result::Result<(PathBuf, u64), String> {
    let (path, addr) = text
        .rsplit_once('@')
        .ok_or_else(|| format!("expected PATH@ADDRESS, got `{text}`"))?;
    Ok((PathBuf::from(path), parse_number(addr)?))
}

/// Parses `PATH` or `PATH@BIAS`.
///
/// # Errors
///
/// Returns a message suitable for command-line diagnostics.
pub fn parse_elf(text: &str) -> std::result::Result<(PathBuf, u64), String> {
    if text.contains('@') {
        parse_placement(text)
    } else {
        Ok((PathBuf::from(text), 0))
    }
}

/// Parses an inclusive `START-END` address range.
///
/// # Errors
///
/// Returns a message suitable for command-line diagnostics.
pub fn parse_range(text: &str) -> std::result::Result<RangeInclusive<u64>, String> {
    let (start, end) = text
        .split_once('-')
        .ok_or_else(|| format!("expected START-END, got `{text}`"))?;
    let (start, end) = (parse_number(start)?, parse_number(end)?);
    if start > end {
        return Err(format!("empty range `{text}`"));
    }
    Ok(start..=end)
}
