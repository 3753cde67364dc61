//! Per-request scratch directory holding the materialized source file.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Removed with everything in it (including compiler artifacts) on
/// [`Workspace::cleanup`], or on drop if the request is abandoned.
#[derive(Debug)]
pub struct Workspace {
    dir: TempDir,
    source: PathBuf,
}

impl Workspace {
    pub fn create(root: &Path, filename: &str, extension: &str, code: &str) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("relay-")
            .tempdir_in(root)
            .with_context(|| format!("creating scratch directory under {}", root.display()))?;
        let source = dir.path().join(format!("{}{extension}", source_stem(filename)));
        fs::write(&source, code)
            .with_context(|| format!("writing source file {}", source.display()))?;
        debug!(path = %source.display(), bytes = code.len(), "source written");
        Ok(Self { dir, source })
    }

    pub fn source_path(&self) -> &Path {
        &self.source
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn cleanup(self) {
        let path = self.dir.path().to_path_buf();
        match self.dir.close() {
            Ok(()) => debug!(path = %path.display(), "scratch directory removed"),
            Err(e) => warn!(path = %path.display(), error = %e, "could not remove scratch directory"),
        }
    }
}

/// Keeps the client's base name so `public class Foo` lives in `Foo.java`;
/// anything that is not an identifier character is dropped.
fn source_stem(filename: &str) -> String {
    let stem: String = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    match stem.chars().next() {
        Some(c) if !c.is_ascii_digit() => stem,
        _ => "Main".to_string(),
    }
}
