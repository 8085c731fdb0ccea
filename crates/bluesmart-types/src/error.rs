//! Error types for bluesmart-types.

use thiserror::Error;

/// Errors from UUID literal expansion.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum UuidError {
    /// The literal is not valid hex or not a well-formed full UUID.
    #[error("malformed UUID literal: {0:?}")]
    Malformed(String),

    /// The literal has a length other than 4, 8, or 36 characters.
    #[error("UUID literal must be 4, 8, or 36 characters, got {0}")]
    BadLength(usize),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_offender() {
        let err = UuidError::Malformed("zzzz".into());
        assert!(err.to_string().contains("zzzz"));

        let err = UuidError::BadLength(7);
        assert!(err.to_string().contains('7'));
    }
}
