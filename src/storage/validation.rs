//! Key validation for object storage.
//!
//! Keys come from queue messages, so they are checked before they are used
//! to build local paths: a key must never resolve outside the bucket root or
//! the scratch directory it is materialised into.

use super::StorageError;
use std::path::{Component, Path, PathBuf};

/// Validates and normalizes an object key into a relative path.
///
/// Rejects keys that:
/// - Are empty or normalize to nothing
/// - Are absolute
/// - Contain `..`, root or prefix components
///
/// ```
/// use pinnerd::storage::validate_key;
///
/// assert!(validate_key("7/photos/cat.png").is_ok());
/// assert!(validate_key("7/../etc/passwd").is_err());
/// assert!(validate_key("/etc/passwd").is_err());
/// ```
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] describing the rejected component.
pub fn validate_key(key: &str) -> Result<PathBuf, StorageError> {
    if key.is_empty() {
        return Err(StorageError::invalid_key(key, "empty key"));
    }

    let path = Path::new(key);
    if path.is_absolute() {
        return Err(StorageError::invalid_key(key, "absolute path"));
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => normalized.push(name),
            Component::CurDir => {},
            Component::ParentDir => return Err(StorageError::invalid_key(key, "contains '..'")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(StorageError::invalid_key(key, "contains root or prefix"));
            },
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(StorageError::invalid_key(key, "normalized to empty path"));
    }

    Ok(normalized)
}

/// Path of an object inside a materialised directory.
///
/// Keys are laid out `<namespace>/<relative path>`; the namespace segment is
/// dropped so the directory holds only the user's tree.
///
/// # Errors
///
/// Returns [`StorageError::InvalidKey`] for keys without a namespace or
/// whose remainder is not a safe relative path.
pub fn relative_path(key: &str) -> Result<PathBuf, StorageError> {
    match key.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => validate_key(rest),
        _ => Err(StorageError::invalid_key(key, "missing namespace segment")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key_normalizes() {
        assert_eq!(
            validate_key("./1/docs/a.txt").unwrap(),
            PathBuf::from("1/docs/a.txt")
        );
        assert!(validate_key("").is_err());
        assert!(validate_key(".").is_err());
        assert!(validate_key("../x").is_err());
        assert!(validate_key("/abs").is_err());
    }

    #[test]
    fn test_relative_path_strips_namespace() {
        assert_eq!(
            relative_path("1/docs/readme.md").unwrap(),
            PathBuf::from("docs/readme.md")
        );
        assert_eq!(relative_path("1/a.txt").unwrap(), PathBuf::from("a.txt"));
    }

    #[test]
    fn test_relative_path_rejects() {
        assert!(matches!(
            relative_path("no-namespace"),
            Err(StorageError::InvalidKey { .. })
        ));
        assert!(relative_path("1/").is_err());
        assert!(relative_path("1/../../etc/passwd").is_err());
        assert!(relative_path("1//abs").is_err());
    }
}
