//! Sanitization of names before they go to a device.

use crate::error::Error;

/// Longest name we will send, in characters.
pub const MAX_NAME_LENGTH: usize = 255;

/// Cleans a filename for SendObjectInfo: strips NUL bytes and path
/// separators, trims whitespace, rejects dot-only and empty names, and
/// truncates to [`MAX_NAME_LENGTH`] characters.
pub fn sanitize_object_name(name: &str) -> Result<String, Error> {
    let cleaned: String =
        name.chars().filter(|c| *c != '\0' && *c != '/' && *c != '\\').collect();
    let trimmed = cleaned.trim();

    if trimmed.is_empty() {
        return Err(Error::PreconditionFailed("object name is empty".to_string()));
    }
    if trimmed.chars().all(|c| c == '.') {
        return Err(Error::PreconditionFailed(format!(
            "object name {trimmed:?} is only dots"
        )));
    }

    Ok(trimmed.chars().take(MAX_NAME_LENGTH).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_names_pass_through() {
        assert_eq!(sanitize_object_name("photo.jpg").unwrap(), "photo.jpg");
        assert_eq!(sanitize_object_name("My Holiday Pics").unwrap(), "My Holiday Pics");
        assert_eq!(sanitize_object_name(".hidden").unwrap(), ".hidden");
    }

    #[test]
    fn test_separators_and_nuls_stripped() {
        assert_eq!(sanitize_object_name("a/b\\c.txt").unwrap(), "abc.txt");
        assert_eq!(sanitize_object_name("nul\0byte").unwrap(), "nulbyte");
        assert_eq!(sanitize_object_name("../etc/passwd").unwrap(), "..etcpasswd");
    }

    #[test]
    fn test_whitespace_trimmed() {
        assert_eq!(sanitize_object_name("  notes.txt  ").unwrap(), "notes.txt");
    }

    #[test]
    fn test_dot_only_names_rejected() {
        for name in [".", "..", "...", "....."] {
            assert!(sanitize_object_name(name).is_err(), "{name:?} must be rejected");
        }
    }

    #[test]
    fn test_empty_and_whitespace_rejected() {
        assert!(sanitize_object_name("").is_err());
        assert!(sanitize_object_name("   ").is_err());
        assert!(sanitize_object_name("//\\/").is_err());
        assert!(sanitize_object_name("\0").is_err());
    }

    #[test]
    fn test_truncated_to_max_length() {
        let long = "x".repeat(300);
        let out = sanitize_object_name(&long).unwrap();
        assert_eq!(out.len(), MAX_NAME_LENGTH);
    }
}
