//! Content blob storage for JSONL input/output/error files.
//!
//! Files live under `storage_path/<id>.jsonl`. Writes go through a
//! temp-file-then-rename so a reader never observes a partially written
//! file, and result lines are appended one record at a time as a worker
//! finishes each request so progress survives a crash mid-batch.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use crate::error::Result;

#[derive(Clone)]
pub struct FileBlobStore {
    root: PathBuf,
    /// Serializes appends so two chunks writing the same output file
    /// interleave by whole line rather than by byte.
    append_lock: Arc<Mutex<()>>,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            append_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn path_for(&self, id: &str) -> PathBuf {
        self.root.join(format!("{id}.jsonl"))
    }

    /// Writes `contents` atomically: a temp file in the same directory is
    /// written and fsynced, then renamed over the final path.
    pub async fn put(&self, id: &str, contents: &[u8]) -> Result<PathBuf> {
        let final_path = self.path_for(id);
        let tmp_path = self.root.join(format!(".{id}.tmp"));

        let contents = contents.to_vec();
        let tmp_path_clone = tmp_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut f = std::fs::File::create(&tmp_path_clone)?;
            f.write_all(&contents)?;
            f.sync_all()?;
            Ok(())
        })
        .await
        .map_err(|e| crate::error::Error::internal(format!("blob write task panicked: {e}")))??;

        tokio::fs::rename(&tmp_path, &final_path).await?;
        Ok(final_path)
    }

    pub async fn open_lines(&self, id: &str) -> Result<Vec<String>> {
        let path = self.path_for(id);
        let file = tokio::fs::File::open(&path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                out.push(line);
            }
        }
        Ok(out)
    }

    /// Reads the exact stored bytes, with no line-splitting or trimming —
    /// what a downloader gets back must be bit-identical to what was `put`.
    pub async fn read_bytes(&self, id: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(self.path_for(id)).await?)
    }

    pub async fn size(&self, id: &str) -> Result<i64> {
        let meta = tokio::fs::metadata(self.path_for(id)).await?;
        Ok(meta.len() as i64)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let path = self.path_for(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends one JSONL record, creating the file if it does not exist yet.
    /// Holds an internal lock so concurrent chunk workers don't interleave
    /// partial writes within the same output file.
    pub async fn append_line(&self, id: &str, line: &str) -> Result<()> {
        let _guard = self.append_lock.lock().await;
        let path = self.path_for(id);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
