//! Temporary file naming.
//!
//! Backing files for anonymous streams are placed in a per-process default
//! directory and named `<basename>_<suffix><extension>` with a random suffix.
//! The directory is resolved from the first of: an explicit
//! [`set_default_path`], the `TMPDIR` environment variable, the platform
//! default temporary directory.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use rand::distributions::Alphanumeric;
use rand::Rng;

/// Environment variable consulted for the default temporary directory.
pub const TMPDIR_ENV: &str = "TMPDIR";

struct TempNaming {
    path: Option<PathBuf>,
    base_name: String,
    extension: String,
}

fn naming() -> &'static Mutex<TempNaming> {
    static NAMING: OnceLock<Mutex<TempNaming>> = OnceLock::new();
    NAMING.get_or_init(|| {
        Mutex::new(TempNaming {
            path: None,
            base_name: String::from("em"),
            extension: String::new(),
        })
    })
}

/// Overrides the process-wide default temporary directory.
pub fn set_default_path(path: impl Into<PathBuf>) {
    naming().lock().unwrap().path = Some(path.into());
}

/// Sets the filename prefix used for generated temporary names.
pub fn set_default_base_name(name: impl Into<String>) {
    naming().lock().unwrap().base_name = name.into();
}

/// Sets the extension appended to generated temporary names. A leading dot
/// is not implied.
pub fn set_default_extension(ext: impl Into<String>) {
    naming().lock().unwrap().extension = ext.into();
}

/// The effective default temporary directory.
pub fn default_tmp_path() -> PathBuf {
    if let Some(path) = naming().lock().unwrap().path.clone() {
        return path;
    }
    if let Some(dir) = env::var_os(TMPDIR_ENV) {
        return PathBuf::from(dir);
    }
    return env::temp_dir();
}

/// The configured filename prefix.
pub fn default_base_name() -> String {
    naming().lock().unwrap().base_name.clone()
}

/// The configured extension.
pub fn default_extension() -> String {
    naming().lock().unwrap().extension.clone()
}

/// Produces a fresh temporary file path.
///
/// `post_base` is inserted between the configured base name and the random
/// suffix; `dir` and `ext` override the configured directory and extension.
/// The returned path did not name an existing file at generation time.
pub fn tempnam(post_base: &str, dir: Option<&Path>, ext: Option<&str>) -> PathBuf {
    let state = naming().lock().unwrap();
    let dir = dir.map(Path::to_path_buf).unwrap_or_else(|| {
        state
            .path
            .clone()
            .or_else(|| env::var_os(TMPDIR_ENV).map(PathBuf::from))
            .unwrap_or_else(env::temp_dir)
    });
    let ext = ext.unwrap_or(&state.extension);

    loop {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();
        let name = if post_base.is_empty() {
            format!("{}_{}{}", state.base_name, suffix, ext)
        } else {
            format!("{}_{}_{}{}", state.base_name, post_base, suffix, ext)
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
    }
}

#[cfg(test)]
mod test {
    use std::path::Path;

    use rstest::*;

    use super::tempnam;

    #[fixture]
    fn tmp_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[rstest]
    fn test_tempnam_unique(tmp_dir: tempfile::TempDir) {
        let a = tempnam("stream", Some(tmp_dir.path()), Some(".dat"));
        let b = tempnam("stream", Some(tmp_dir.path()), Some(".dat"));

        assert_ne!(a, b);
        assert_eq!(a.parent(), Some(tmp_dir.path()));
        assert_eq!(a.extension(), Some(std::ffi::OsStr::new("dat")));
        assert!(!a.exists());
    }

    #[rstest]
    fn test_tempnam_post_base(tmp_dir: tempfile::TempDir) {
        let path = tempnam("sorted", Some(tmp_dir.path()), None);
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.contains("sorted"), "name={}", name);
    }

    #[test]
    fn test_tempnam_dir_override() {
        let path = tempnam("", Some(Path::new("/nonexistent-dir")), None);
        assert!(path.starts_with("/nonexistent-dir"));
    }
}
