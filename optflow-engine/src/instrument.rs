//! Option instrument identifier parsing.
//!
//! Identifiers are hyphen-delimited, `CCY-EXPIRY-STRIKE-SIDEFLAG`
//! (e.g. `ETH-20240315-3000-C`). Malformed identifiers degrade rather than
//! fail: fewer than four segments yields an instrument with empty
//! expiry/strike and an unknown side.

use serde::{Deserialize, Serialize};

/// Option side decoded from the identifier's fourth segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OptionSide {
    Call,
    Put,
    Unknown,
}

impl OptionSide {
    /// Convert to display string
    pub fn as_str(&self) -> &'static str {
        match self {
            OptionSide::Call => "CALL",
            OptionSide::Put => "PUT",
            OptionSide::Unknown => "",
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, OptionSide::Call)
    }

    pub fn is_put(&self) -> bool {
        matches!(self, OptionSide::Put)
    }
}

impl std::fmt::Display for OptionSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Decomposed instrument identifier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ParsedInstrument {
    /// Underlying currency (e.g. "ETH")
    pub currency: String,
    /// Expiry segment, verbatim (e.g. "20240315"); empty when malformed
    pub expiry: String,
    /// Strike segment, verbatim (e.g. "3000"); empty when malformed
    pub strike: String,
    /// Call/Put side; Unknown only for identifiers with fewer than 4 segments
    pub side: OptionSide,
}

/// Decompose an instrument identifier. Never fails.
///
/// With at least four segments the side is Call iff the fourth segment is
/// exactly "C"; any other value maps to Put. That asymmetric default matches
/// the upstream display contract and is intentionally preserved.
pub fn parse_instrument(identifier: &str) -> ParsedInstrument {
    let segments: Vec<&str> = identifier.split('-').collect();
    if segments.len() >= 4 {
        ParsedInstrument {
            currency: segments[0].to_string(),
            expiry: segments[1].to_string(),
            strike: segments[2].to_string(),
            side: if segments[3] == "C" {
                OptionSide::Call
            } else {
                OptionSide::Put
            },
        }
    } else {
        ParsedInstrument {
            currency: segments.first().copied().unwrap_or_default().to_string(),
            expiry: String::new(),
            strike: String::new(),
            side: OptionSide::Unknown,
        }
    }
}
