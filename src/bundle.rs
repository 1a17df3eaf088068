//! On-disk layout of an exported bundle.
//!
//! ```text
//! <root>/index.html
//! <root>/viewer.js, viewer.css       bundled viewer
//! <root>/data/manifest.json        authoritative, written last
//! <root>/data/manifest.js          same payload for file:// viewers
//! <root>/data/chunks/<shard>.js    window.__chatshardChunk(<shard>,[...]);
//! <root>/data/index/<bucket>.js    window.__chatshardIndex(<bucket>,[...]);
//! <root>/resources/<kind>s/<name>
//! ```
//!
//! Every data file is a self-executing script so a viewer opened from disk
//! can load it with a `<script>` tag instead of `fetch`.

use std::path::{Path, PathBuf};

use crate::error::{ExportError, Result};
use crate::render::escape_html;
use crate::resources::remove_stale_parts;

pub const CHUNK_LOADER: &str = "window.__chatshardChunk";
pub const INDEX_LOADER: &str = "window.__chatshardIndex";
pub const MANIFEST_GLOBAL: &str = "window.__chatshardManifest";

const VIEWER_JS: &str = include_str!("../assets/viewer.js");
const VIEWER_CSS: &str = include_str!("../assets/viewer.css");

#[derive(Debug, Clone)]
pub struct BundleLayout {
    root: PathBuf,
}

impl BundleLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn chunks_dir(&self) -> PathBuf {
        self.data_dir().join("chunks")
    }

    pub fn index_dir(&self) -> PathBuf {
        self.data_dir().join("index")
    }

    pub fn manifest_json(&self) -> PathBuf {
        self.data_dir().join("manifest.json")
    }

    pub fn manifest_js(&self) -> PathBuf {
        self.data_dir().join("manifest.js")
    }

    pub fn resources_dir(&self) -> PathBuf {
        self.root.join("resources")
    }

    pub fn index_html(&self) -> PathBuf {
        self.root.join("index.html")
    }

    pub fn chunk_file(&self, shard_id: u32) -> PathBuf {
        self.chunks_dir().join(format!("{}.js", shard_id))
    }

    /// Path of a shard file relative to the bundle root, as stored in the
    /// manifest.
    pub fn chunk_rel(shard_id: u32) -> String {
        format!("data/chunks/{}.js", shard_id)
    }

    pub fn bucket_file(&self, prefix: &str) -> PathBuf {
        self.index_dir().join(format!("{}.js", prefix))
    }

    pub fn is_finalized(&self) -> bool {
        self.manifest_json().exists()
    }

    /// Create the directory tree. A bundle that already has a manifest is
    /// never written into again unless `force` is set, in which case its
    /// `data/` tree is removed first. Copied resources are kept; part files
    /// from an interrupted copy are removed.
    pub async fn prepare(&self, force: bool) -> Result<()> {
        if self.is_finalized() {
            if !force {
                return Err(ExportError::BundleExists(self.root.clone()));
            }
            let data = self.data_dir();
            tokio::fs::remove_dir_all(&data)
                .await
                .map_err(|e| ExportError::io(&data, e))?;
            tracing::info!(path = %data.display(), "removed previous bundle data");
        }
        for dir in [self.chunks_dir(), self.index_dir(), self.resources_dir()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| ExportError::io(&dir, e))?;
        }
        let resources = self.resources_dir();
        let stale = remove_stale_parts(&resources)
            .await
            .map_err(|e| ExportError::io(&resources, e))?;
        if stale > 0 {
            tracing::info!(count = stale, "removed partial resource copies");
        }
        Ok(())
    }

    /// Write the viewer assets and the entry document that loads them.
    pub async fn write_index_html(&self, title: &str) -> Result<()> {
        write_atomic(&self.root.join("viewer.js"), VIEWER_JS.as_bytes()).await?;
        write_atomic(&self.root.join("viewer.css"), VIEWER_CSS.as_bytes()).await?;

        let html = format!(
            r#"<!DOCTYPE html>
<html lang="en">
<head>
<meta charset="UTF-8">
<meta name="viewport" content="width=device-width, initial-scale=1.0">
<title>{title}</title>
<link rel="stylesheet" href="viewer.css">
</head>
<body>
<div id="app" data-manifest="data/manifest.js"></div>
<script src="data/manifest.js"></script>
<script src="viewer.js"></script>
</body>
</html>
"#,
            title = escape_html(title)
        );
        let path = self.index_html();
        write_atomic(&path, html.as_bytes()).await
    }
}

/// Write to `<path>.tmp` and rename into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    tokio::fs::write(&tmp, bytes)
        .await
        .map_err(|e| ExportError::writer(&tmp, e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ExportError::io(path, e))
}

/// Split `<loader>(<arg>,<json>);` into its argument and JSON payload.
pub fn unwrap_loader<'a>(body: &'a str, loader: &str) -> Option<(&'a str, &'a str)> {
    let rest = body.trim().strip_prefix(loader)?.strip_prefix('(')?;
    let rest = rest.strip_suffix(';')?.trim_end().strip_suffix(')')?;
    let (arg, json) = rest.split_once(',')?;
    Some((arg.trim(), json.trim()))
}
