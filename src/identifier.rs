//! Validation of the `BV…` video identifiers accepted by the crawler.

use std::fmt;

use serde::Serialize;

use crate::error::CrawlError;

const PREFIX: &str = "BV";
const ID_LEN: usize = 12;

/// A trimmed, validated video identifier. The remote API is case-sensitive,
/// so the original casing is kept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct VideoId(String);

impl VideoId {
    pub fn parse(raw: &str) -> Result<Self, CrawlError> {
        let trimmed = raw.trim();
        // Byte length equals char length once every char is ASCII.
        let valid = trimmed.is_ascii()
            && trimmed.len() == ID_LEN
            && trimmed[..PREFIX.len()].eq_ignore_ascii_case(PREFIX)
            && trimmed[PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_alphanumeric());

        if !valid {
            return Err(CrawlError::InvalidIdentifier(raw.to_owned()));
        }
        Ok(Self(trimmed.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_trimmed_lowercase_and_keeps_case() {
        let id = VideoId::parse(" bv1abc2defgh ").unwrap();
        assert_eq!(id.as_str(), "bv1abc2defgh");

        let id = VideoId::parse("BV1AYKgzAE68").unwrap();
        assert_eq!(id.to_string(), "BV1AYKgzAE68");
    }

    #[test]
    fn rejects_wrong_length() {
        for raw in ["", "BV", "BV1abc2defg", "BV1abc2defghi", "  BV1abc  "] {
            let err = VideoId::parse(raw).unwrap_err();
            assert_eq!(err.kind(), "InvalidIdentifier", "{raw:?}");
        }
    }

    #[test]
    fn rejects_bad_prefix_or_characters() {
        for raw in ["AV1abc2defgh", "B V1abc2defg", "BV1abc-defgh", "BV1abc2défg", "BV1abc_defgh"] {
            assert!(VideoId::parse(raw).is_err(), "{raw:?}");
        }
    }
}
