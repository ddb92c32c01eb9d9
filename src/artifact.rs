//! Where finished comment forests are persisted.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::NamedTempFile;
use tracing::info;

use crate::transcode::PublishedComment;

/// Accepts a serializable forest and returns a durable location for it.
pub trait ArtifactSink: Send + Sync {
    fn store(&self, name: &str, forest: &[PublishedComment]) -> Result<String>;
}

/// Writes `<name>_comments.json` into a directory, replacing any previous
/// artifact of the same name atomically.
#[derive(Debug, Clone)]
pub struct FsArtifactSink {
    root: PathBuf,
}

impl FsArtifactSink {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.root
            .join(format!("{}_comments.json", sanitize_file_stem(name)))
    }
}

impl ArtifactSink for FsArtifactSink {
    fn store(&self, name: &str, forest: &[PublishedComment]) -> Result<String> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating {}", self.root.display()))?;

        let path = self.path_for(name);
        let tmp = NamedTempFile::new_in(&self.root)
            .with_context(|| format!("creating temp file in {}", self.root.display()))?;
        {
            let mut writer = BufWriter::new(tmp.as_file());
            serde_json::to_writer_pretty(&mut writer, forest)
                .with_context(|| format!("serializing {}", path.display()))?;
            writer.flush().context("flushing artifact")?;
        }
        tmp.persist(&path)
            .with_context(|| format!("moving artifact into {}", path.display()))?;

        info!(path = %path.display(), roots = forest.len(), "artifact written");
        Ok(path.to_string_lossy().into_owned())
    }
}

/// Replaces characters that are not allowed in file names on common
/// platforms.
pub fn sanitize_file_stem(name: &str) -> String {
    let stem: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '\\' | '/' | ':' | '"' | '*' | '?' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    if stem.is_empty() {
        "untitled".to_owned()
    } else {
        stem
    }
}
