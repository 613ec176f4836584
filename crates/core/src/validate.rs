//! Boundary validation for operation inputs and outputs.

use crate::error::{DomainError, DomainResult};

/// Shape check applied once at the operation boundary.
///
/// Inputs are validated before any guard runs; outputs before they are handed
/// back to the caller. The default accepts everything, so types with no
/// constraints only need an empty `impl`.
pub trait Validate {
    fn validate(&self) -> DomainResult<()> {
        Ok(())
    }
}

impl Validate for () {}

impl Validate for bool {}

impl<T: Validate> Validate for Option<T> {
    fn validate(&self) -> DomainResult<()> {
        match self {
            Some(inner) => inner.validate(),
            None => Ok(()),
        }
    }
}

impl<T: Validate> Validate for Vec<T> {
    fn validate(&self) -> DomainResult<()> {
        self.iter().try_for_each(Validate::validate)
    }
}

/// Reject empty or whitespace-only text and enforce an upper bound in chars.
pub fn require_text(field: &str, value: &str, max_chars: usize) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max_chars {
        return Err(DomainError::validation(format!(
            "{field} exceeds {max_chars} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Positive(i64);

    impl Validate for Positive {
        fn validate(&self) -> DomainResult<()> {
            if self.0 > 0 {
                Ok(())
            } else {
                Err(DomainError::validation("must be positive"))
            }
        }
    }

    #[test]
    fn vec_validation_stops_at_first_invalid_element() {
        let values = vec![Positive(1), Positive(0), Positive(2)];
        assert_eq!(
            values.validate(),
            Err(DomainError::validation("must be positive"))
        );
    }

    #[test]
    fn require_text_checks_blank_and_length() {
        assert!(require_text("title", "hello", 10).is_ok());
        assert!(require_text("title", "   ", 10).is_err());
        assert!(require_text("title", "hello world", 5).is_err());
    }
}
