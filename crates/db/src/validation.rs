//! Input validation for user-supplied text fields.
//!
//! These run before any transaction is opened so a bad request never takes a
//! parent lock.

use thiserror::Error;

pub const MAX_NAME_LEN: usize = 200;
pub const MAX_TITLE_LEN: usize = 500;
pub const MAX_DESCRIPTION_LEN: usize = 16_384;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is too long: {len} characters (max {max})")]
    TooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("Invalid label color: '{0}'. Expected #rrggbb")]
    InvalidColor(String),
}

fn validate_text(field: &'static str, value: &str, max: usize) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    let len = value.chars().count();
    if len > max {
        return Err(ValidationError::TooLong { field, len, max });
    }
    Ok(())
}

/// Validate a board or list name.
///
/// ```
/// use db::validation::validate_name;
///
/// assert!(validate_name("Backlog").is_ok());
/// assert!(validate_name("   ").is_err());
/// ```
pub fn validate_name(name: &str) -> Result<(), ValidationError> {
    validate_text("name", name, MAX_NAME_LEN)
}

pub fn validate_title(title: &str) -> Result<(), ValidationError> {
    validate_text("title", title, MAX_TITLE_LEN)
}

/// Descriptions may be empty, only the length is bounded.
pub fn validate_description(description: &str) -> Result<(), ValidationError> {
    let len = description.chars().count();
    if len > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::TooLong {
            field: "description",
            len,
            max: MAX_DESCRIPTION_LEN,
        });
    }
    Ok(())
}

pub fn validate_color(color: &str) -> Result<(), ValidationError> {
    let valid = color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidColor(color.to_string()))
    }
}
