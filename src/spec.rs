use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// A single prefix-rewrite rule. The first rule whose `source` matches
/// a stream path wins; later rules are not consulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RenameRule {
    pub source: String,
    pub dest: String,
}

/// Writer-side task configuration: the directories to walk and inject
/// into the produced archive stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterSpec {
    pub archive_dirs: Vec<PathBuf>,
}

impl WriterSpec {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Declarative rule set governing one task: paths to drop, prefixes to
/// rewrite, and (for write-producing tasks) the directories to archive.
///
/// A spec is pure data. Matching never touches the filesystem and the
/// engine treats the spec as immutable for the duration of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecFile {
    #[serde(skip)]
    pub file: Option<PathBuf>,

    pub ignore: Vec<String>,
    pub rename: Vec<RenameRule>,
    pub writer: Option<WriterSpec>,

    /// Force the modification time of written entries to the time of
    /// writing instead of preserving the source time.
    pub same_chtimes: bool,
}

/// Resolved link descriptor handed to the filesystem writer.
#[derive(Debug, Clone)]
pub struct Link {
    /// Path where the link is created.
    pub name: PathBuf,
    /// Recorded target, never resolved or canonicalized.
    pub path: PathBuf,
    pub mode: u32,
    pub symbolic: bool,
}

/// Strips the leading `/` or `./` and any trailing `/` so that stream
/// paths and rule paths compare in the same form.
fn normalize(path: &str) -> &str {
    let path = path.trim_start_matches('/');
    let path = path.strip_prefix("./").unwrap_or(path);
    path.trim_end_matches('/')
}

impl SpecFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a spec from a JSON file. Absent fields default to empty
    /// rule sets.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open spec file: {}", path.display()))?;
        let mut spec: SpecFile = serde_json::from_reader(file)
            .with_context(|| format!("Failed to parse spec file: {}", path.display()))?;
        spec.file = Some(path.to_path_buf());
        Ok(spec)
    }

    /// Returns true when `path` equals or is a descendant of any ignore
    /// pattern. Matching is component-wise, so pattern `var/cache` drops
    /// `var/cache` and `var/cache/ldconfig` but not `var/cachedir`.
    pub fn ignored(&self, path: &str) -> bool {
        let path = normalize(path);
        self.ignore.iter().any(|pattern| {
            let pattern = normalize(pattern);
            !pattern.is_empty()
                && (path == pattern
                    || path
                        .strip_prefix(pattern)
                        .is_some_and(|rest| rest.starts_with('/')))
        })
    }

    /// Rewrites the first matching rename rule's `source` prefix to its
    /// `dest`. Returns the (possibly unchanged) path and whether a rule
    /// applied.
    pub fn renamed(&self, path: &str) -> (String, bool) {
        let normalized = normalize(path);
        for rule in &self.rename {
            let source = normalize(&rule.source);
            if source.is_empty() {
                continue;
            }
            let rest = if normalized == source {
                Some("")
            } else {
                normalized
                    .strip_prefix(source)
                    .filter(|rest| rest.starts_with('/'))
            };
            if let Some(rest) = rest {
                let dest = normalize(&rule.dest);
                return (format!("{}{}", dest, rest), true);
            }
        }
        (normalized.to_string(), false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_rules() -> SpecFile {
        SpecFile {
            ignore: vec!["/.dockerenv".to_string(), "var/cache".to_string()],
            rename: vec![
                RenameRule {
                    source: "etc/portage".to_string(),
                    dest: "etc/pkg".to_string(),
                },
                RenameRule {
                    source: "etc".to_string(),
                    dest: "cfg".to_string(),
                },
            ],
            ..SpecFile::new()
        }
    }

    #[test]
    fn test_ignored_exact_and_descendants() {
        let spec = spec_with_rules();
        assert!(spec.ignored("/.dockerenv"));
        assert!(spec.ignored(".dockerenv"));
        assert!(spec.ignored("./var/cache"));
        assert!(spec.ignored("var/cache/ldconfig/aux-cache"));
        assert!(!spec.ignored("var/cachedir"));
        assert!(!spec.ignored("var"));
    }

    #[test]
    fn test_empty_pattern_matches_nothing() {
        let spec = SpecFile {
            ignore: vec!["".to_string(), "/".to_string()],
            ..SpecFile::new()
        };
        assert!(!spec.ignored("etc/hosts"));
    }

    #[test]
    fn test_rename_first_match_wins() {
        let spec = spec_with_rules();
        // Both rules textually match; only the first applies.
        let (path, changed) = spec.renamed("etc/portage/make.conf");
        assert!(changed);
        assert_eq!(path, "etc/pkg/make.conf");

        let (path, changed) = spec.renamed("etc/hosts");
        assert!(changed);
        assert_eq!(path, "cfg/hosts");
    }

    #[test]
    fn test_rename_component_boundary() {
        let spec = spec_with_rules();
        let (path, changed) = spec.renamed("etcetera/file");
        assert!(!changed);
        assert_eq!(path, "etcetera/file");
    }

    #[test]
    fn test_rename_no_match_keeps_path() {
        let spec = spec_with_rules();
        let (path, changed) = spec.renamed("usr/bin/env");
        assert!(!changed);
        assert_eq!(path, "usr/bin/env");
    }

    #[test]
    fn test_spec_from_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spec.json");
        let mut file = File::create(&path).unwrap();
        file.write_all(
            br#"{
                "ignore": ["/.dockerenv"],
                "rename": [{"source": "opt", "dest": "srv"}],
                "writer": {"archive_dirs": ["/tmp/rootfs"]}
            }"#,
        )
        .unwrap();

        let spec = SpecFile::from_file(&path).unwrap();
        assert!(spec.ignored(".dockerenv"));
        assert_eq!(spec.renamed("opt/app").0, "srv/app");
        assert_eq!(
            spec.writer.unwrap().archive_dirs,
            vec![PathBuf::from("/tmp/rootfs")]
        );
        assert!(!spec.same_chtimes);
    }
}
