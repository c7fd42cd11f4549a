use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("server path is empty")]
    Empty,
    #[error("server path must be absolute: {0}")]
    NotAbsolute(String),
    #[error("server path contains unsupported component: {0}")]
    UnsupportedComponent(String),
}

/// Canonical form of a server folder path: leading slash, no trailing slash,
/// no empty or `.` segments. The root is `/`.
pub fn normalize_server_path(path: &str) -> Result<String, PathError> {
    let path = path.trim();
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if !path.starts_with('/') {
        return Err(PathError::NotAbsolute(path.to_string()));
    }

    let mut out = String::with_capacity(path.len());
    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => return Err(PathError::UnsupportedComponent(segment.to_string())),
            part => {
                out.push('/');
                out.push_str(part);
            }
        }
    }
    if out.is_empty() {
        out.push('/');
    }
    Ok(out)
}

pub fn join_server_path(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{name}")
}

pub fn parent_server_path(path: &str) -> Option<String> {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let (parent, _) = trimmed.rsplit_once('/')?;
    if parent.is_empty() {
        Some("/".to_string())
    } else {
        Some(parent.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_slashes_and_dots() {
        assert_eq!(normalize_server_path("/Photos/").unwrap(), "/Photos");
        assert_eq!(normalize_server_path("//Photos/./2024").unwrap(), "/Photos/2024");
        assert_eq!(normalize_server_path("/").unwrap(), "/");
    }

    #[test]
    fn rejects_relative_and_parent_paths() {
        assert_eq!(normalize_server_path(""), Err(PathError::Empty));
        assert!(matches!(
            normalize_server_path("Photos"),
            Err(PathError::NotAbsolute(_))
        ));
        assert!(matches!(
            normalize_server_path("/Photos/../secret"),
            Err(PathError::UnsupportedComponent(_))
        ));
    }

    #[test]
    fn joins_and_splits() {
        assert_eq!(join_server_path("/", "Photos"), "/Photos");
        assert_eq!(join_server_path("/Photos", "a.jpg"), "/Photos/a.jpg");
        assert_eq!(parent_server_path("/Photos/a.jpg").as_deref(), Some("/Photos"));
        assert_eq!(parent_server_path("/Photos").as_deref(), Some("/"));
        assert_eq!(parent_server_path("/"), None);
    }
}
