use std::path::{Component, Path, PathBuf};

use crate::error::{ErrorLocation, RepairError, Result};

/// Accept a store-provided id as a single file name component.
/// Rejects empty ids, separators, `.`/`..` and control characters.
pub fn file_component(id: &str) -> Result<&str> {
    let invalid = |why: &str| {
        RepairError::data_quality(
            format!("id {id:?} cannot be used as a file name: {why}"),
            ErrorLocation::in_document("audit dump"),
        )
    };
    if id.is_empty() {
        return Err(invalid("empty"));
    }
    if id.chars().any(|c| c.is_control() || c == '/' || c == '\\') {
        return Err(invalid("contains a separator or control character"));
    }
    let mut components = Path::new(id).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(id),
        _ => Err(invalid("not a plain name")),
    }
}

/// Join validated components under `root`.
pub fn join_under_root(root: &Path, parts: &[&str]) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for part in parts {
        path.push(file_component(part)?);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_ids_pass() {
        assert_eq!(
            file_component("3f1c9e0a-7d2b-4c55-9a61-0c2f7e0b9d11").unwrap(),
            "3f1c9e0a-7d2b-4c55-9a61-0c2f7e0b9d11"
        );
        assert_eq!(file_component("pipeline_a.json").unwrap(), "pipeline_a.json");
    }

    #[test]
    fn traversal_is_rejected() {
        for bad in ["", ".", "..", "../etc", "a/b", "a\\b", "x\ny", "/abs"] {
            assert!(
                matches!(file_component(bad), Err(RepairError::DataQuality { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn join_keeps_paths_under_root() {
        let root = Path::new("dump");
        assert_eq!(
            join_under_root(root, &["projects", "p1"]).unwrap(),
            Path::new("dump").join("projects").join("p1")
        );
        assert!(join_under_root(root, &["projects", ".."]).is_err());
    }
}
