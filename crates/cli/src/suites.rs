//! Locating and loading suite files.

use std::path::{Path, PathBuf};

use unified_format::{FormatError, Suite};

/// Expand `paths` into suite files. Directories contribute their `*.json`
/// entries (not recursively), sorted by file name.
pub fn collect(paths: &[PathBuf]) -> Result<Vec<PathBuf>, String> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            let entries = std::fs::read_dir(path)
                .map_err(|e| format!("error reading directory '{}': {}", path.display(), e))?;
            let mut found: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
                .collect();
            found.sort();
            files.extend(found);
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            return Err(format!("no such file or directory: {}", path.display()));
        }
    }
    Ok(files)
}

#[derive(Debug)]
pub enum LoadError {
    Io(std::io::Error),
    Format(FormatError),
}

impl std::fmt::Display for LoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadError::Io(e) => write!(f, "read error: {}", e),
            LoadError::Format(e) => write!(f, "{}", e),
        }
    }
}

pub fn load(path: &Path) -> Result<Suite, LoadError> {
    let source = std::fs::read_to_string(path).map_err(LoadError::Io)?;
    unified_format::from_str(&source).map_err(LoadError::Format)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn directories_are_searched_flat_and_sorted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.json"), "{}").unwrap();
        fs::write(dir.path().join("a.json"), "{}").unwrap();
        fs::write(dir.path().join("notes.txt"), "").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("c.json"), "{}").unwrap();

        let files = collect(&[dir.path().to_path_buf()]).unwrap();
        let names: Vec<_> = files
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, ["a.json", "b.json"]);
    }

    #[test]
    fn missing_path_is_an_error() {
        let err = collect(&[PathBuf::from("does/not/exist.json")]).unwrap_err();
        assert!(err.contains("does/not/exist.json"));
    }

    #[test]
    fn load_reports_schema_errors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("suite.json");
        fs::write(
            &path,
            r#"{"description": "d", "schemaVersion": "2.0", "tests": []}"#,
        )
        .unwrap();
        let err = load(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported schema version"));
    }
}
