//! crates/talk_diary_core/src/identifier.rs
//!
//! Login identifiers of the form `name.tag`.
//!
//! Users log in by typing an identifier such as `liam.GG`. The identifier is
//! normalized to a presentation-cased name (`Liam`) and a lowercased tag
//! (`gg`) before it is used to look up or create a profile. Parsing is pure
//! and total: malformed input is returned as an [`IdentifierError`], never a
//! panic.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Segment separator between the name and the tag.
const SEPARATOR: char = '.';

/// One to ten ASCII letters or digits.
const SEGMENT_PATTERN: &str = r"^[A-Za-z0-9]{1,10}$";

fn segment_regex() -> &'static Regex {
    static SEGMENT: OnceLock<Regex> = OnceLock::new();
    SEGMENT.get_or_init(|| Regex::new(SEGMENT_PATTERN).expect("segment pattern is valid"))
}

/// Which half of the identifier a validation error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Name,
    Tag,
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Name => f.write_str("name"),
            Segment::Tag => f.write_str("tag"),
        }
    }
}

/// Why a raw identifier was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentifierError {
    #[error("expected exactly one '.' between name and tag, found {0} segments")]
    SegmentCount(usize),
    #[error("the {0} must not be empty")]
    EmptySegment(Segment),
    #[error("the {0} must be 1 to 10 letters or digits")]
    InvalidSegment(Segment),
}

/// A normalized `(name, tag)` login identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identifier {
    name: String,
    tag: String,
}

impl Identifier {
    /// Parses and normalizes a raw `name.tag` string.
    pub fn parse(input: &str) -> Result<Self, IdentifierError> {
        let parts: Vec<&str> = input.trim().split(SEPARATOR).collect();
        let [raw_name, raw_tag] = parts.as_slice() else {
            return Err(IdentifierError::SegmentCount(parts.len()));
        };

        validate_segment(raw_name, Segment::Name)?;
        validate_segment(raw_tag, Segment::Tag)?;

        Ok(Self {
            name: presentation_case(raw_name),
            tag: raw_tag.to_ascii_lowercase(),
        })
    }

    /// Wraps values that are already normalized, such as rows read back from
    /// the backend.
    pub(crate) fn from_normalized(name: String, tag: String) -> Self {
        Self { name, tag }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn into_parts(self) -> (String, String) {
        (self.name, self.tag)
    }
}

/// Parses a raw identifier, discarding the rejection reason.
pub fn parse_identifier(input: &str) -> Option<Identifier> {
    Identifier::parse(input).ok()
}

impl FromStr for Identifier {
    type Err = IdentifierError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, SEPARATOR, self.tag)
    }
}

fn validate_segment(segment: &str, which: Segment) -> Result<(), IdentifierError> {
    if segment.is_empty() {
        return Err(IdentifierError::EmptySegment(which));
    }
    if !segment_regex().is_match(segment) {
        return Err(IdentifierError::InvalidSegment(which));
    }
    Ok(())
}

// Segments are validated ASCII alnum at this point, so byte slicing is safe.
fn presentation_case(segment: &str) -> String {
    let (first, rest) = segment.split_at(1);
    let mut out = String::with_capacity(segment.len());
    out.push_str(&first.to_ascii_uppercase());
    out.push_str(&rest.to_ascii_lowercase());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_name_and_tag_case() {
        let id = parse_identifier("liam.GG").unwrap();
        assert_eq!(id.name(), "Liam");
        assert_eq!(id.tag(), "gg");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let id = parse_identifier("  sARAH.Home1 \n").unwrap();
        assert_eq!(id.name(), "Sarah");
        assert_eq!(id.tag(), "home1");
    }

    #[test]
    fn accepts_boundary_lengths_and_digits() {
        let id = parse_identifier("a.1").unwrap();
        assert_eq!((id.name(), id.tag()), ("A", "1"));

        let id = parse_identifier("ABCDEFGHIJ.0123456789").unwrap();
        assert_eq!((id.name(), id.tag()), ("Abcdefghij", "0123456789"));

        let id = parse_identifier("9lives.X").unwrap();
        assert_eq!(id.name(), "9lives");
    }

    #[test]
    fn rejects_extra_segments() {
        assert_eq!(
            Identifier::parse("A.B.C"),
            Err(IdentifierError::SegmentCount(3))
        );
        assert_eq!(Identifier::parse("liam"), Err(IdentifierError::SegmentCount(1)));
        assert!(parse_identifier("").is_none());
    }

    #[test]
    fn rejects_empty_segments() {
        assert_eq!(
            Identifier::parse("."),
            Err(IdentifierError::EmptySegment(Segment::Name))
        );
        assert_eq!(
            Identifier::parse(".tag"),
            Err(IdentifierError::EmptySegment(Segment::Name))
        );
        assert_eq!(
            Identifier::parse("name."),
            Err(IdentifierError::EmptySegment(Segment::Tag))
        );
    }

    #[test]
    fn rejects_overlong_segments() {
        assert_eq!(
            Identifier::parse("toolongname123.gg"),
            Err(IdentifierError::InvalidSegment(Segment::Name))
        );
        assert_eq!(
            Identifier::parse("liam.abcdefghijk"),
            Err(IdentifierError::InvalidSegment(Segment::Tag))
        );
    }

    #[test]
    fn rejects_non_alphanumeric_characters() {
        for input in ["name_.gg", "na-me.gg", "liam.g g", "léa.gg", "liam.ｇｇ", "li am.gg"] {
            assert!(parse_identifier(input).is_none(), "{input} should be rejected");
        }
    }

    #[test]
    fn display_round_trips_through_parse() {
        for input in ["liam.GG", "MUJI.kakao", "x1.Y2"] {
            let id = parse_identifier(input).unwrap();
            let again = parse_identifier(&id.to_string()).unwrap();
            assert_eq!(id, again);
        }
    }

    #[test]
    fn from_str_matches_parse() {
        let id: Identifier = "chun.SIK".parse().unwrap();
        assert_eq!(id.to_string(), "Chun.sik");
        assert!("bad".parse::<Identifier>().is_err());
    }

    #[test]
    fn error_messages_name_the_segment() {
        let err = Identifier::parse("liam.g_g").unwrap_err();
        assert_eq!(err.to_string(), "the tag must be 1 to 10 letters or digits");
    }
}
