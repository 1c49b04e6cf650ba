//! Request validation for the Laneflow API
//!
//! Provides type-safe validation with clear error messages.

use crate::error::AppError;
use std::collections::HashMap;

/// Validation result type
pub type ValidationResult<T> = Result<T, AppError>;

fn field_error(field: &str, message: String) -> AppError {
    let mut details = HashMap::new();
    details.insert(field.to_string(), vec![message]);
    AppError::ValidationError { details }
}

/// String validation helpers
pub mod string {
    use super::*;

    /// Validate required non-empty string
    pub fn required(value: &str, field: &str) -> ValidationResult<String> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Err(field_error(field, format!("{} cannot be empty", field)))
        } else {
            Ok(trimmed.to_string())
        }
    }

    /// Validate required string with max length
    pub fn required_max(value: &str, field: &str, max: usize) -> ValidationResult<String> {
        let trimmed = required(value, field)?;
        if trimmed.len() > max {
            Err(field_error(
                field,
                format!("{} must be at most {} characters", field, max),
            ))
        } else {
            Ok(trimmed)
        }
    }
}

/// Numeric validation helpers
pub mod number {
    use super::*;

    /// Validate a positive (non-zero) integer
    pub fn positive(value: i32, field: &str) -> ValidationResult<i32> {
        if value > 0 {
            Ok(value)
        } else {
            Err(field_error(field, format!("{} must be positive", field)))
        }
    }

    /// Validate a non-negative integer
    pub fn non_negative(value: i32, field: &str) -> ValidationResult<i32> {
        if value >= 0 {
            Ok(value)
        } else {
            Err(field_error(field, format!("{} must not be negative", field)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_required_rejects_blank() {
        assert!(string::required("  ", "name").is_err());
        assert_eq!(string::required(" Proposta ", "name").unwrap(), "Proposta");
    }

    #[test]
    fn test_required_max() {
        assert!(string::required_max("abcdef", "name", 5).is_err());
        assert!(string::required_max("abc", "name", 5).is_ok());
    }

    #[test]
    fn test_number_bounds() {
        assert!(number::positive(0, "delay").is_err());
        assert!(number::positive(30, "delay").is_ok());
        assert!(number::non_negative(0, "position").is_ok());
        assert!(number::non_negative(-1, "position").is_err());
    }
}
