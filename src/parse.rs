//! Parsing of numeric tool output.
//!
//! `resize2fs -P` prints its estimate as the last word of a human readable (and translated)
//! sentence:
//!
//! ```text
//! LANG=en_US.utf8
//!   resize2fs 1.45.3 (14-Jul-2019)
//!   Estimated minimum size of the filesystem: 5813528
//! LANG=zh_CN.utf8
//!   resize2fs 1.44.1 (24-Mar-2018)
//!   预计文件系统的最小尺寸：61817
//! ```
//!
//! The only stable part across versions and locales is that the number comes last.

use std::num::ParseIntError;

use once_cell::sync::Lazy;
use regex_automata::meta::Regex;
use thiserror::Error;

/// Errors from [`parse_trailing_number`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The output contained nothing but separators.
    #[error("no tokens in tool output")]
    Empty,
    /// The last token was not an integer.
    #[error("trailing token {token:?} is not a number: {source}")]
    NotANumber {
        token: String,
        #[source]
        source: ParseIntError,
    },
}

// Any Unicode punctuation (general category P) or whitespace.  Translated messages end
// their sentences with the script's own colon, danda or full stop.
static SEPARATORS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[\p{P}\s]+").expect("separator pattern is valid")
});

/// Splits `output` on runs of whitespace and Unicode punctuation and parses the last token as an
/// unsigned integer.
pub fn parse_trailing_number(output: &str) -> Result<u64, ParseError> {
    let token = SEPARATORS
        .split(output)
        .map(|span| &output[span.start..span.end])
        .filter(|t| !t.is_empty())
        .last()
        .ok_or(ParseError::Empty)?;

    token.parse().map_err(|source| ParseError::NotANumber {
        token: token.to_string(),
        source,
    })
}
