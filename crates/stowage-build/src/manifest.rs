//! Dependency manifest parsing.
//!
//! The manifest is a plain text file with one `name==version` pin per line.
//! Blank lines and `#` comments are ignored; anything else is rejected so a
//! typo never silently drops a dependency.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{BuildError, BuildResult};

/// A single pinned dependency from the manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Requirement {
    /// Package name.
    pub name: String,
    /// Exact pinned version.
    pub version: String,
}

impl Requirement {
    /// File name of the package archive in the index.
    #[must_use]
    pub fn archive_name(&self) -> String {
        format!("{}-{}.pkg", self.name, self.version)
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}=={}", self.name, self.version)
    }
}

/// Read and parse the manifest at `path`.
///
/// # Errors
///
/// Returns [`BuildError::ManifestMissing`] when the file does not exist and
/// [`BuildError::ManifestSyntax`] on the first malformed entry.
pub fn load_manifest(path: &Path) -> BuildResult<Vec<Requirement>> {
    if !path.is_file() {
        return Err(BuildError::ManifestMissing {
            path: path.to_path_buf(),
        });
    }
    let raw = fs::read_to_string(path)
        .map_err(|source| BuildError::io("read_manifest", path, source))?;
    parse_manifest(&raw)
}

/// Parse manifest text into requirements, preserving declaration order.
///
/// # Errors
///
/// Returns [`BuildError::ManifestSyntax`] on the first malformed entry.
pub fn parse_manifest(raw: &str) -> BuildResult<Vec<Requirement>> {
    let mut requirements = Vec::new();
    for (index, line) in raw.lines().enumerate() {
        let entry = line.trim();
        if entry.is_empty() || entry.starts_with('#') {
            continue;
        }
        requirements.push(parse_entry(entry).ok_or_else(|| BuildError::ManifestSyntax {
            line: index + 1,
            entry: entry.to_string(),
        })?);
    }
    Ok(requirements)
}

fn parse_entry(entry: &str) -> Option<Requirement> {
    let (name, version) = entry.split_once("==")?;
    let name = name.trim();
    let version = version.trim();
    let name_ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    let version_ok = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-'));
    if !name_ok || !version_ok {
        return None;
    }
    Some(Requirement {
        name: name.to_string(),
        version: version.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_pins_comments_and_blanks() {
        let raw = "# web stack\nfastapi==0.111.0\n\nuvicorn==0.30.1\n  # trailing comment\n";
        let requirements = parse_manifest(raw).expect("manifest should parse");
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].to_string(), "fastapi==0.111.0");
        assert_eq!(requirements[1].archive_name(), "uvicorn-0.30.1.pkg");
    }

    #[test]
    fn rejects_unpinned_and_malformed_entries() {
        for raw in [
            "flask>=2.0",
            "flask",
            "flask==",
            "==1.0",
            "flask == 1.0 extra",
            "fla sk==1.0",
        ] {
            let err = parse_manifest(raw).expect_err("entry should be rejected");
            assert!(matches!(err, BuildError::ManifestSyntax { line: 1, .. }), "{raw}");
        }
    }

    #[test]
    fn missing_file_is_a_distinct_error() {
        let err = load_manifest(Path::new("/definitely/not/here.txt"))
            .expect_err("missing manifest should fail");
        assert!(matches!(err, BuildError::ManifestMissing { .. }));
    }
}
