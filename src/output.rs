//! Utilities for working with output data and paths.
//!
//! This module contains the [`Output`] struct, which represents a file produced
//! by a task, and the helpers the scheduler uses to write outputs into the
//! output directory and to remove the ones that went stale.

use std::fs;
use std::io;
use std::sync::Arc;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

use crate::core::{Artifact, Hash32};

/// The content of an [`Output`] file.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum OutputData {
    /// Text content (UTF-8).
    Utf8(String),
    /// Binary content (raw bytes).
    Binary(Arc<[u8]>),
}

impl AsRef<[u8]> for OutputData {
    fn as_ref(&self) -> &[u8] {
        match self {
            OutputData::Utf8(s) => s.as_bytes(),
            OutputData::Binary(b) => b,
        }
    }
}

/// A single file produced by a task.
///
/// Tasks never touch the file system themselves. They return outputs, and the
/// scheduler fingerprints them, stores them in the cache and (for published
/// tasks) writes them into the output directory.
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct Output {
    /// The destination path of the file, relative to the output directory.
    pub path: Utf8PathBuf,
    /// The content of the file to be written.
    pub data: OutputData,
}

impl Output {
    /// Creates a new text output. The path is normalized.
    pub fn text(path: impl AsRef<Utf8Path>, data: impl Into<String>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            data: OutputData::Utf8(data.into()),
        }
    }

    /// Creates a new binary output. The path is normalized.
    pub fn binary(path: impl AsRef<Utf8Path>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            data: OutputData::Binary(data.into()),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        self.data.as_ref()
    }

    /// The content as text, if it is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match &self.data {
            OutputData::Utf8(s) => Some(s),
            OutputData::Binary(b) => std::str::from_utf8(b).ok(),
        }
    }

    pub fn fingerprint(&self) -> Hash32 {
        Hash32::hash(self.bytes())
    }

    pub(crate) fn to_artifact(&self) -> Artifact {
        Artifact::new(self.path.clone(), self.fingerprint())
    }
}

/// Normalize a path, removing things like `.` and `..`.
///
/// CAUTION: This does not resolve symlinks (unlike [`std::fs::canonicalize`]).
/// This may cause incorrect or surprising behavior at times. This should be
/// used carefully.
///
/// Adapted from
/// <https://github.com/rust-lang/cargo/blob/f7acf448fc127df9a77c52cc2bba027790ac4931/crates/cargo-util/src/paths.rs#L76-L116>
pub(crate) fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => unreachable!(),
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Writes outputs into `dir`, creating parent directories as needed.
pub(crate) fn save_outputs(dir: &Utf8Path, outputs: &[Output]) -> io::Result<()> {
    for output in outputs {
        let file_path = dir.join(&output.path);

        if let Some(parent_dir) = file_path.parent() {
            fs::create_dir_all(parent_dir)?;
        }

        fs::write(&file_path, output.bytes())?;
    }

    Ok(())
}

/// Writes only the outputs whose file is missing or differs from the artifact.
/// Used when outputs are reused from the cache. Returns how many were written.
pub(crate) fn restore_outputs(dir: &Utf8Path, outputs: &[Output]) -> io::Result<usize> {
    let stale: Vec<Output> = outputs
        .iter()
        .filter(|output| {
            let path = dir.join(&output.path);
            match Hash32::hash_file(&path) {
                Ok(hash) => hash != output.fingerprint(),
                Err(_) => true,
            }
        })
        .cloned()
        .collect();

    save_outputs(dir, &stale)?;
    Ok(stale.len())
}

/// Removes files that were published earlier but are no longer produced.
pub(crate) fn remove_stale(dir: &Utf8Path, old: &[Artifact], new: &[Artifact]) -> io::Result<()> {
    for artifact in old {
        if new.iter().any(|a| a.path == artifact.path) {
            continue;
        }

        let path = dir.join(&artifact.path);
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!("removed stale output {path}"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Utf8Path::new("./css/../js/app.js")), "js/app.js");
        assert_eq!(normalize_path(Utf8Path::new("a/./b/")), "a/b");
        assert_eq!(normalize_path(Utf8Path::new("../x")), "../x");
    }

    #[test]
    fn text_and_binary_share_fingerprints() {
        let a = Output::text("index.html", "<p>hi</p>");
        let b = Output::binary("index.html", b"<p>hi</p>".to_vec());
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(b.as_str(), Some("<p>hi</p>"));
    }

    #[test]
    fn restore_skips_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let outputs = vec![
            Output::text("css/main.css", "a{}"),
            Output::text("js/app.min.js", "x()"),
        ];

        assert_eq!(restore_outputs(root, &outputs).unwrap(), 2);
        assert_eq!(restore_outputs(root, &outputs).unwrap(), 0);

        fs::write(root.join("css/main.css"), "tampered").unwrap();
        assert_eq!(restore_outputs(root, &outputs).unwrap(), 1);
        assert_eq!(fs::read_to_string(root.join("css/main.css")).unwrap(), "a{}");
    }

    #[test]
    fn stale_outputs_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(dir.path()).unwrap();

        let old = vec![Output::text("a.txt", "a"), Output::text("b.txt", "b")];
        save_outputs(root, &old).unwrap();

        let old: Vec<_> = old.iter().map(Output::to_artifact).collect();
        let new = vec![Output::text("a.txt", "a2").to_artifact()];
        remove_stale(root, &old, &new).unwrap();

        assert!(root.join("a.txt").exists());
        assert!(!root.join("b.txt").exists());
    }
}
