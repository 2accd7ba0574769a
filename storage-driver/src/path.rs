//! Validation of storage paths.
//!
//! Storage paths are absolute, `/`-separated and never end with a separator,
//! for example `/docker/registry/v2/blobs`. The root `/` is a valid path.

use camino::Utf8Path;

use crate::error::{StorageError, StorageErrorKind};

/// Reasons a storage path is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    /// The path does not start with `/`.
    #[error("path must be absolute: {0:?}")]
    NotAbsolute(String),

    /// The path ends with `/`.
    #[error("path must not end with a separator: {0:?}")]
    TrailingSeparator(String),

    /// The path contains `//`.
    #[error("path contains an empty component: {0:?}")]
    EmptyComponent(String),

    /// The path contains a `.` or `..` component.
    #[error("path contains a relative component: {0:?}")]
    RelativeComponent(String),
}

/// Check that `path` is a well-formed storage path.
pub fn validate(path: &Utf8Path) -> Result<(), PathError> {
    let raw = path.as_str();
    if raw == "/" {
        return Ok(());
    }

    let Some(rest) = raw.strip_prefix('/') else {
        return Err(PathError::NotAbsolute(raw.to_owned()));
    };

    if rest.ends_with('/') {
        return Err(PathError::TrailingSeparator(raw.to_owned()));
    }

    for component in rest.split('/') {
        match component {
            "" => return Err(PathError::EmptyComponent(raw.to_owned())),
            "." | ".." => return Err(PathError::RelativeComponent(raw.to_owned())),
            _ => {}
        }
    }

    Ok(())
}

/// Validate `path`, reporting failures as an invalid request from `engine`.
pub fn check(engine: &'static str, path: &Utf8Path) -> Result<(), StorageError> {
    validate(path).map_err(|err| {
        StorageError::builder(engine, StorageErrorKind::InvalidRequest, err)
            .path(path)
            .build()
    })
}

/// Whether `path` is the storage root.
pub fn is_root(path: &Utf8Path) -> bool {
    path.as_str() == "/"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_absolute_paths() {
        for path in ["/", "/a", "/docker/registry/v2/blobs", "/a/b.c/_d-e"] {
            assert_eq!(validate(Utf8Path::new(path)), Ok(()), "{path}");
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        assert!(matches!(
            validate(Utf8Path::new("a/b")),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            validate(Utf8Path::new("")),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            validate(Utf8Path::new("/a/")),
            Err(PathError::TrailingSeparator(_))
        ));
        assert!(matches!(
            validate(Utf8Path::new("/a//b")),
            Err(PathError::EmptyComponent(_))
        ));
        assert!(matches!(
            validate(Utf8Path::new("/a/../b")),
            Err(PathError::RelativeComponent(_))
        ));
    }

    #[test]
    fn check_reports_invalid_request() {
        let err = check("memory", Utf8Path::new("relative")).unwrap_err();
        assert_eq!(err.kind(), StorageErrorKind::InvalidRequest);
        assert_eq!(err.path(), Some(Utf8Path::new("relative")));
    }
}
