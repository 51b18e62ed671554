//! Canonical VFS path form.
//!
//! Forward slashes, lowercase, no empty/`.`/`..` segments, no leading or
//! trailing slash. The builder normalizes when packing and the VFS
//! re-normalizes at load and lookup, so both sides always compare the same
//! spelling.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VfsPathError {
    #[error("empty VFS path")]
    Empty,
    #[error("VFS path '{0}' contains a '.' or '..' segment")]
    RelativeSegment(String),
    #[error("VFS path '{0}' contains a backslash-escaped or empty segment")]
    EmptySegment(String),
}

/// Normalize a path into canonical VFS form.
pub fn normalize(path: &str) -> Result<String, VfsPathError> {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_matches('/');
    if trimmed.is_empty() {
        return Err(VfsPathError::Empty);
    }
    let mut out = String::with_capacity(trimmed.len());
    for segment in trimmed.split('/') {
        if segment.is_empty() {
            return Err(VfsPathError::EmptySegment(path.to_string()));
        }
        if segment == "." || segment == ".." {
            return Err(VfsPathError::RelativeSegment(path.to_string()));
        }
        if !out.is_empty() {
            out.push('/');
        }
        for c in segment.chars() {
            out.extend(c.to_lowercase());
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lowercases_and_unifies_separators() {
        assert_eq!(
            normalize("Images\\Backgrounds\\Forest.PNG").unwrap(),
            "images/backgrounds/forest.png"
        );
    }

    #[test]
    fn strips_leading_and_trailing_slashes() {
        assert_eq!(normalize("/audio/theme.ogg/").unwrap(), "audio/theme.ogg");
    }

    #[test]
    fn rejects_dot_segments() {
        assert!(matches!(
            normalize("a/./b"),
            Err(VfsPathError::RelativeSegment(_))
        ));
        assert!(matches!(
            normalize("../escape"),
            Err(VfsPathError::RelativeSegment(_))
        ));
    }

    #[test]
    fn rejects_empty_and_double_slash() {
        assert_eq!(normalize(""), Err(VfsPathError::Empty));
        assert_eq!(normalize("//"), Err(VfsPathError::Empty));
        assert!(matches!(
            normalize("a//b"),
            Err(VfsPathError::EmptySegment(_))
        ));
    }

    #[test]
    fn case_insensitive_lookup_form_is_stable() {
        assert_eq!(normalize("A/B").unwrap(), normalize("a/b").unwrap());
    }
}
