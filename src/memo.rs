//! Extraction of the depositor's user id from a transfer comment.

use std::fmt;

use thiserror::Error;

use crate::model::UserId;

/// Why a comment could not be attributed to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ParseFailure {
    #[error("empty")]
    Empty,
    #[error("not-numeric")]
    NotNumeric,
    /// Well-formed id with no matching user. Only produced at settlement time.
    #[error("unknown-user")]
    UnknownUser,
}

/// Parse a comment consisting solely of a decimal user id, optionally
/// surrounded by whitespace.
pub fn parse(comment: &str) -> Result<UserId, ParseFailure> {
    let trimmed = comment.trim();
    if trimmed.is_empty() {
        return Err(ParseFailure::Empty);
    }
    // `u64::from_str` accepts a leading '+', which is not a bare id
    if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseFailure::NotNumeric);
    }
    trimmed.parse().map_err(|_| ParseFailure::NotNumeric)
}

/// Render the comment a depositor must attach for `user`.
pub fn comment_for(user: UserId) -> impl fmt::Display {
    user
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_id() {
        assert_eq!(parse("42"), Ok(42));
    }

    #[test]
    fn trims_surrounding_whitespace() {
        assert_eq!(parse("  42\n"), Ok(42));
        assert_eq!(parse("\t7 "), Ok(7));
    }

    #[test]
    fn empty_and_blank_are_empty() {
        assert_eq!(parse(""), Err(ParseFailure::Empty));
        assert_eq!(parse("   \n"), Err(ParseFailure::Empty));
    }

    #[test]
    fn rejects_non_numeric() {
        assert_eq!(parse("hello"), Err(ParseFailure::NotNumeric));
        assert_eq!(parse("42 please"), Err(ParseFailure::NotNumeric));
        assert_eq!(parse("4 2"), Err(ParseFailure::NotNumeric));
        assert_eq!(parse("+42"), Err(ParseFailure::NotNumeric));
        assert_eq!(parse("-42"), Err(ParseFailure::NotNumeric));
        assert_eq!(parse("0x2a"), Err(ParseFailure::NotNumeric));
    }

    #[test]
    fn rejects_out_of_range() {
        assert_eq!(parse("18446744073709551616"), Err(ParseFailure::NotNumeric));
        assert_eq!(parse("18446744073709551615"), Ok(u64::MAX));
    }

    #[test]
    fn comment_round_trips_through_parse() {
        assert_eq!(parse(&comment_for(123456789).to_string()), Ok(123456789));
    }

    #[test]
    fn reason_tags() {
        assert_eq!(ParseFailure::Empty.to_string(), "empty");
        assert_eq!(ParseFailure::NotNumeric.to_string(), "not-numeric");
        assert_eq!(ParseFailure::UnknownUser.to_string(), "unknown-user");
    }
}
