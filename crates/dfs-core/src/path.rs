//! Filename validation
//!
//! DFS filenames are flat: 1 to 16 characters from `[a-z0-9]`. They are
//! validated before any other operation touches them, which also keeps
//! them safe to use directly as local file names.

use crate::error::DfsError;
use crate::MAX_FILENAME_LEN;

/// Returns true iff `name` consists of 1-16 lowercase alphanumeric characters
pub fn check_filename(name: &str) -> bool {
    (1..=MAX_FILENAME_LEN).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
}

/// Validate a filename, returning `BadFilename` if it is not acceptable
pub fn validate_filename(name: &str) -> Result<(), DfsError> {
    if check_filename(name) {
        Ok(())
    } else {
        Err(DfsError::BadFilename(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_filenames() {
        assert!(check_filename("a"));
        assert!(check_filename("abc123"));
        assert!(check_filename("notes1"));
        assert!(check_filename("0123456789abcdef"));
    }

    #[test]
    fn test_invalid_filenames() {
        assert!(!check_filename(""));
        assert!(!check_filename("0123456789abcdefg"));
        assert!(!check_filename("Abc"));
        assert!(!check_filename("a.b"));
        assert!(!check_filename("a b"));
        assert!(!check_filename("../etc"));
        assert!(!check_filename("é"));
    }

    #[test]
    fn test_validate_filename_error() {
        assert_eq!(
            validate_filename("Bad"),
            Err(DfsError::BadFilename("Bad".into()))
        );
        assert!(validate_filename("good").is_ok());
    }

    #[test]
    fn test_length_boundary_exhaustive() {
        for len in 0..=20 {
            let name = "x".repeat(len);
            assert_eq!(check_filename(&name), (1..=16).contains(&len), "len {}", len);
        }
    }
}
