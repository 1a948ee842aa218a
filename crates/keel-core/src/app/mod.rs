//! Read-only query surface over a source tree.

mod environment;

pub use environment::Environment;

use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use keel_common::{KeelError, KeelResult};
use once_cell::sync::OnceCell;
use regex::Regex;
use serde::de::DeserializeOwned;
use walkdir::WalkDir;

/// A source tree rooted at an absolute directory.
///
/// All queries return paths relative to the root with forward slashes. The
/// directory listing is walked once per [`App`] and memoized; the listing is
/// never refreshed, matching the single-generation lifetime of the value.
#[derive(Debug)]
pub struct App {
    source: PathBuf,
    listing: OnceCell<Vec<Entry>>,
}

#[derive(Debug, Clone)]
struct Entry {
    rel: String,
    is_dir: bool,
}

impl App {
    /// Open a source tree. Relative paths are resolved against the current
    /// working directory.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::SourceUnreadable`] when the directory does not
    /// exist or cannot be inspected.
    pub fn new(path: impl AsRef<Path>) -> KeelResult<Self> {
        let path = path.as_ref();
        let source = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map_err(|e| KeelError::SourceUnreadable {
                    path: path.display().to_string(),
                    cause: e.to_string(),
                })?
                .join(path)
        };

        match std::fs::metadata(&source) {
            Ok(meta) if meta.is_dir() => Ok(App {
                source,
                listing: OnceCell::new(),
            }),
            Ok(_) => Err(KeelError::SourceUnreadable {
                path: source.display().to_string(),
                cause: "not a directory".to_string(),
            }),
            Err(e) => Err(KeelError::SourceUnreadable {
                path: source.display().to_string(),
                cause: e.to_string(),
            }),
        }
    }

    /// The absolute source root.
    #[must_use]
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Check whether a relative path exists (file or directory).
    #[must_use]
    pub fn has_file(&self, path: &str) -> bool {
        self.source.join(path).exists()
    }

    /// Check whether anything (file or directory) matches a glob pattern.
    #[must_use]
    pub fn has_match(&self, pattern: &str) -> bool {
        !self.find_files(pattern).is_empty() || !self.find_directories(pattern).is_empty()
    }

    /// Relative file paths matching a glob pattern. `**` matches any number
    /// of path segments and `{a,b}` alternatives are supported.
    #[must_use]
    pub fn find_files(&self, pattern: &str) -> Vec<String> {
        self.find_matches(pattern, false)
    }

    /// Relative directory paths matching a glob pattern.
    #[must_use]
    pub fn find_directories(&self, pattern: &str) -> Vec<String> {
        self.find_matches(pattern, true)
    }

    /// Files matching a glob whose contents match the regex.
    #[must_use]
    pub fn find_files_with_content(&self, pattern: &str, regex: &Regex) -> Vec<String> {
        self.find_files(pattern)
            .into_iter()
            .filter(|file| {
                self.read_file(file)
                    .map(|content| regex.is_match(&content))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Read a file relative to the source root, with `\r\n` normalized to
    /// `\n`.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::SourceUnreadable`] when the file is missing or
    /// unreadable.
    pub fn read_file(&self, name: &str) -> KeelResult<String> {
        let path = self.source.join(name);
        let data = std::fs::read_to_string(&path).map_err(|e| KeelError::SourceUnreadable {
            path: name.to_string(),
            cause: e.to_string(),
        })?;
        Ok(data.replace("\r\n", "\n"))
    }

    /// Read and parse a JSON file. The reader accepts the human JSON dialect:
    /// `//` and `/* */` comments and trailing commas.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Parse`] on parse failure.
    pub fn read_json<T: DeserializeOwned>(&self, name: &str) -> KeelResult<T> {
        let data = self.read_file(name)?;
        json5::from_str(&data).map_err(|e| KeelError::Parse {
            path: name.to_string(),
            format: "json".to_string(),
            cause: e.to_string(),
        })
    }

    /// Read and parse a YAML file.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Parse`] on parse failure.
    pub fn read_yaml<T: DeserializeOwned>(&self, name: &str) -> KeelResult<T> {
        let data = self.read_file(name)?;
        serde_yaml::from_str(&data).map_err(|e| KeelError::Parse {
            path: name.to_string(),
            format: "yaml".to_string(),
            cause: e.to_string(),
        })
    }

    /// Read and parse a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`KeelError::Parse`] on parse failure.
    pub fn read_toml<T: DeserializeOwned>(&self, name: &str) -> KeelResult<T> {
        let data = self.read_file(name)?;
        toml::from_str(&data).map_err(|e| KeelError::Parse {
            path: name.to_string(),
            format: "toml".to_string(),
            cause: e.to_string(),
        })
    }

    /// Check whether a path is a regular file with any execute bit set.
    #[must_use]
    pub fn is_executable(&self, name: &str) -> bool {
        use std::os::unix::fs::PermissionsExt;

        let path = self.source.join(name);
        match std::fs::metadata(&path) {
            Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
            Err(_) => false,
        }
    }

    fn find_matches(&self, pattern: &str, dirs: bool) -> Vec<String> {
        let options = MatchOptions {
            case_sensitive: true,
            require_literal_separator: true,
            require_literal_leading_dot: false,
        };

        let patterns: Vec<Pattern> = expand_braces(pattern)
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .collect();
        if patterns.is_empty() {
            return Vec::new();
        }

        self.listing()
            .iter()
            .filter(|entry| entry.is_dir == dirs)
            .filter(|entry| patterns.iter().any(|p| p.matches_with(&entry.rel, options)))
            .map(|entry| entry.rel.clone())
            .collect()
    }

    fn listing(&self) -> &[Entry] {
        self.listing.get_or_init(|| {
            let mut entries = Vec::new();
            for entry in WalkDir::new(&self.source)
                .follow_links(false)
                .into_iter()
                .filter_map(Result::ok)
            {
                let Ok(rel) = entry.path().strip_prefix(&self.source) else {
                    continue;
                };
                if rel.as_os_str().is_empty() {
                    continue;
                }
                let rel = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                entries.push(Entry {
                    rel,
                    is_dir: entry.file_type().is_dir(),
                });
            }
            entries.sort_by(|a, b| a.rel.cmp(&b.rel));
            entries
        })
    }
}

/// Expand one level of `{a,b}` alternatives into separate glob patterns.
fn expand_braces(pattern: &str) -> Vec<String> {
    let Some(open) = pattern.find('{') else {
        return vec![pattern.to_string()];
    };
    let Some(close) = pattern[open..].find('}').map(|i| open + i) else {
        return vec![pattern.to_string()];
    };

    let prefix = &pattern[..open];
    let suffix = &pattern[close + 1..];
    pattern[open + 1..close]
        .split(',')
        .flat_map(|alt| expand_braces(&format!("{prefix}{alt}{suffix}")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn fixture() -> (tempfile::TempDir, App) {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::write(dir.path().join("package.json"), "{\"name\": \"x\"}\n").unwrap();
        fs::write(dir.path().join("src/index.js"), "console.log(1)\n").unwrap();
        fs::write(dir.path().join("src/nested/util.ts"), "export {}\n").unwrap();
        let app = App::new(dir.path()).unwrap();
        (dir, app)
    }

    #[test]
    fn missing_directory_is_an_error() {
        let err = App::new("/definitely/not/here").unwrap_err();
        assert!(matches!(err, KeelError::SourceUnreadable { .. }));
    }

    #[test]
    fn has_file_and_match() {
        let (_dir, app) = fixture();
        assert!(app.has_file("package.json"));
        assert!(!app.has_file("Gemfile"));
        assert!(app.has_match("src"));
        assert!(app.has_match("**/*.ts"));
        assert!(!app.has_match("**/*.rb"));
    }

    #[test]
    fn find_files_doublestar() {
        let (_dir, app) = fixture();
        assert_eq!(app.find_files("**/*.js"), vec!["src/index.js".to_string()]);
        assert_eq!(
            app.find_files("src/**/*.ts"),
            vec!["src/nested/util.ts".to_string()]
        );
    }

    #[test]
    fn single_star_does_not_cross_separators() {
        let (_dir, app) = fixture();
        assert!(app.find_files("*.ts").is_empty());
    }

    #[test]
    fn find_directories_excludes_files() {
        let (_dir, app) = fixture();
        assert_eq!(app.find_directories("src"), vec!["src".to_string()]);
        assert!(app.find_directories("package.json").is_empty());
    }

    #[test]
    fn brace_alternatives() {
        let (_dir, app) = fixture();
        let files = app.find_files("{package.json,src/index.js}");
        assert_eq!(files.len(), 2);
        assert_eq!(
            expand_braces("{a,b}.{c,d}"),
            vec!["a.c", "a.d", "b.c", "b.d"]
        );
    }

    #[test]
    fn read_file_normalizes_line_endings() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("script.sh"), "line1\r\nline2\r\n").unwrap();
        let app = App::new(dir.path()).unwrap();
        assert_eq!(app.read_file("script.sh").unwrap(), "line1\nline2\n");
    }

    #[test]
    fn read_json_accepts_comments_and_trailing_commas() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("tsconfig.json"),
            "{\n  // comment\n  \"strict\": true, /* inline */\n}\n",
        )
        .unwrap();
        let app = App::new(dir.path()).unwrap();
        let value: serde_json::Value = app.read_json("tsconfig.json").unwrap();
        assert_eq!(value["strict"], true);
    }

    #[test]
    fn read_json_parse_error_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("broken.json"), "{ nope ").unwrap();
        let app = App::new(dir.path()).unwrap();
        let err = app.read_json::<serde_json::Value>("broken.json").unwrap_err();
        assert!(matches!(err, KeelError::Parse { .. }));
    }

    #[test]
    fn is_executable_requires_exec_bit() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("start.sh");
        fs::write(&script, "#!/bin/sh\n").unwrap();
        let app = App::new(dir.path()).unwrap();
        assert!(!app.is_executable("start.sh"));

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        assert!(app.is_executable("start.sh"));
    }

    #[test]
    fn find_files_with_content() {
        let (_dir, app) = fixture();
        let regex = Regex::new(r"console\.log").unwrap();
        assert_eq!(
            app.find_files_with_content("**/*.js", &regex),
            vec!["src/index.js".to_string()]
        );
    }
}
