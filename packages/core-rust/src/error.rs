//! Client-facing error taxonomy and the `#tag` wire code.
//!
//! Every error a caller can see renders to a code string of the form
//! `"#tag[ #tag...] message"`. [`ErrorCode::parse`] splits such a string back
//! into its tags and message, and maps the first recognized tag to an
//! HTTP-like status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status used when no tag is recognized.
pub const DEFAULT_ERROR_STATUS: u16 = 400;

/// Code used when an error string carries no tag at all.
pub const UNTAGGED_CODE: &str = "#error";

/// Errors surfaced to API callers.
///
/// The `Display` output of each variant is its wire code. Variants are
/// client errors; infrastructure failures are modeled separately by the
/// server's execution wrapper and never pass through this type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    #[error("#missing #field '{field}'{}", detail_suffix(.detail))]
    MissingField { field: String, detail: String },

    #[error("#missing #argument '{name}'{}", detail_suffix(.detail))]
    MissingArgument { name: String, detail: String },

    #[error("#wrong_type {field}, expected {expected}.{}", detail_suffix(.detail))]
    WrongType {
        field: String,
        expected: String,
        detail: String,
    },

    #[error("#wrong_format {field}{}.{}", detail_suffix(.reason), detail_suffix(.detail))]
    WrongFormat {
        field: String,
        reason: String,
        detail: String,
    },

    #[error("#access_denied {0}")]
    AccessDenied(String),

    #[error("#duplicate_request request is already in progress")]
    DuplicateRequest,

    #[error("#not_found {0}")]
    NotFound(String),

    /// Catch-all error declared by business logic.
    #[error("#api_error {0}")]
    Declared(String),

    #[error("#method_not_allowed")]
    MethodNotAllowed,

    #[error("#json #parse {0}")]
    MalformedBody(String),

    #[error("#timeout request exceeded {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("#cancelled request was cancelled")]
    Cancelled,

    #[error("#overloaded server is busy, try again later")]
    Overloaded,
}

fn detail_suffix(detail: &str) -> String {
    if detail.is_empty() {
        String::new()
    } else {
        format!(" {detail}")
    }
}

impl ApiError {
    /// Shorthand for a missing field without extra detail.
    #[must_use]
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
            detail: String::new(),
        }
    }

    /// Shorthand for a business-logic error.
    #[must_use]
    pub fn declared(message: impl Into<String>) -> Self {
        Self::Declared(message.into())
    }

    /// Parsed wire code of this error.
    #[must_use]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::parse(&self.to_string())
    }

    /// HTTP-like status derived from the wire code.
    #[must_use]
    pub fn status(&self) -> u16 {
        self.code().status()
    }
}

/// Maps a single `#tag` to its status, if the tag is recognized.
#[must_use]
pub fn status_for_tag(tag: &str) -> Option<u16> {
    match tag {
        "#auth" | "#oauth" | "#access_denied" | "#wrong_password" => Some(401),
        "#not_found" => Some(404),
        "#method_not_allowed" => Some(405),
        "#timeout" => Some(408),
        "#wrong_format" | "#wrong_type" | "#api_error" => Some(417),
        "#overloaded" => Some(503),
        _ => None,
    }
}

/// An error string split into its leading `#` tags and the human message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorCode {
    tags: Vec<String>,
    message: String,
}

impl ErrorCode {
    /// Parses `"#tag #tag message..."`.
    ///
    /// Tags are the leading whitespace-separated tokens that start with `#`,
    /// read left to right. Everything after the last tag is the message, kept
    /// verbatim apart from surrounding whitespace.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut tags = Vec::new();
        let mut rest = raw.trim_start();
        loop {
            let (token, tail) = rest
                .split_once(char::is_whitespace)
                .unwrap_or((rest, ""));
            if token.len() > 1 && token.starts_with('#') {
                tags.push(token.to_string());
                rest = tail.trim_start();
            } else {
                break;
            }
        }
        Self {
            tags,
            message: rest.trim_end().to_string(),
        }
    }

    /// The leading tags, in order.
    #[must_use]
    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Tags joined by spaces, or [`UNTAGGED_CODE`] when there are none.
    #[must_use]
    pub fn code(&self) -> String {
        if self.tags.is_empty() {
            UNTAGGED_CODE.to_string()
        } else {
            self.tags.join(" ")
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Status of the first recognized tag, or [`DEFAULT_ERROR_STATUS`].
    #[must_use]
    pub fn status(&self) -> u16 {
        self.tags
            .iter()
            .find_map(|tag| status_for_tag(tag))
            .unwrap_or(DEFAULT_ERROR_STATUS)
    }

    /// Returns `true` if any tag equals `tag`.
    #[must_use]
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tags.is_empty(), self.message.is_empty()) {
            (true, _) => f.write_str(&self.message),
            (false, true) => f.write_str(&self.tags.join(" ")),
            (false, false) => write!(f, "{} {}", self.tags.join(" "), self.message),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}

impl From<String> for ErrorCode {
    fn from(raw: String) -> Self {
        Self::parse(&raw)
    }
}

impl From<&ApiError> for ErrorCode {
    fn from(err: &ApiError) -> Self {
        err.code()
    }
}

impl From<ApiError> for ErrorCode {
    fn from(err: ApiError) -> Self {
        err.code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tagged_code_maps_to_status_and_message() {
        let code = ErrorCode::parse("#not_found widget missing");
        assert_eq!(code.status(), 404);
        assert_eq!(code.message(), "widget missing");
        assert_eq!(code.code(), "#not_found");
    }

    #[test]
    fn untagged_string_is_whole_message() {
        let code = ErrorCode::parse("no tag here");
        assert_eq!(code.status(), 400);
        assert_eq!(code.message(), "no tag here");
        assert_eq!(code.code(), UNTAGGED_CODE);
    }

    #[test]
    fn multiple_tags_read_left_to_right() {
        let code = ErrorCode::parse("#access_denied #auth #token Token invalid");
        assert_eq!(code.tags(), ["#access_denied", "#auth", "#token"]);
        assert_eq!(code.message(), "Token invalid");
        assert_eq!(code.status(), 401);
    }

    #[test]
    fn first_recognized_tag_wins() {
        let code = ErrorCode::parse("#missing #wrong_type x");
        assert_eq!(code.status(), 417);
    }

    #[test]
    fn unrecognized_tags_fall_back_to_400() {
        let code = ErrorCode::parse("#missing #field 'name'");
        assert_eq!(code.status(), 400);
        assert_eq!(code.message(), "'name'");
    }

    #[test]
    fn status_table() {
        for (tag, status) in [
            ("#auth", 401),
            ("#oauth", 401),
            ("#access_denied", 401),
            ("#wrong_password", 401),
            ("#not_found", 404),
            ("#wrong_format", 417),
            ("#wrong_type", 417),
            ("#api_error", 417),
            ("#method_not_allowed", 405),
        ] {
            assert_eq!(ErrorCode::parse(tag).status(), status, "{tag}");
        }
    }

    #[test]
    fn lone_hash_is_not_a_tag() {
        let code = ErrorCode::parse("# heading");
        assert!(code.tags().is_empty());
        assert_eq!(code.message(), "# heading");
    }

    #[test]
    fn api_error_renders_wire_code() {
        let err = ApiError::WrongType {
            field: "age".into(),
            expected: "int".into(),
            detail: String::new(),
        };
        assert_eq!(err.to_string(), "#wrong_type age, expected int.");
        assert_eq!(err.status(), 417);

        assert_eq!(
            ApiError::missing_field("name").to_string(),
            "#missing #field 'name'"
        );
        assert_eq!(ApiError::NotFound("widget 4".into()).status(), 404);
        assert_eq!(ApiError::MethodNotAllowed.status(), 405);
        assert_eq!(ApiError::DuplicateRequest.status(), 400);
    }

    #[test]
    fn display_round_trips_through_parse() {
        let code = ErrorCode::parse("  #not_found   widget  7 ");
        assert_eq!(code.to_string(), "#not_found widget  7");
    }
}
