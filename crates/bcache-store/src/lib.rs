//! Segmented, fixed-page-size file storage for KV pages.
//!
//! One segment file holds every page of one `(model_id, model_version,
//! layer)` triple, each page occupying a fixed `page_bytes`-sized slot at
//! offset `page_id * page_bytes`. Reads and writes are positioned so callers
//! can issue one coalesced read for an arbitrary contiguous page range
//! instead of one syscall per page — the same shape as a vectored blob read,
//! just specialized to fixed-size slots instead of variable-length blobs.

use bytes::Bytes;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

pub use bcache_model::Error as ModelError;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("segment io error at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("segment {path} is too short: expected at least {expected} bytes, found {actual}")]
    ShortSegment {
        path: Utf8PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("invalid range: {0}")]
    InvalidRange(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for ModelError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::ShortSegment { .. } => ModelError::StorageShort(e.to_string()),
            other => ModelError::InvalidInput(other.to_string()),
        }
    }
}

/// Page-range store rooted at a single directory, laid out as
/// `<root>/<model_id>/<model_version>/layer_<layer>.seg`.
#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: Utf8PathBuf,
    page_bytes: u64,
}

impl SegmentStore {
    pub fn new(root: impl Into<Utf8PathBuf>, page_bytes: u64) -> Self {
        SegmentStore {
            root: root.into(),
            page_bytes,
        }
    }

    pub fn page_bytes(&self) -> u64 {
        self.page_bytes
    }

    pub fn segment_path(&self, model_id: &str, model_version: &str, layer: u32) -> Utf8PathBuf {
        self.root
            .join(model_id)
            .join(model_version)
            .join(format!("layer_{layer}.seg"))
    }

    /// Writes one page's bytes at its fixed slot, creating the segment file
    /// (and parent directories) if it doesn't exist yet.
    pub async fn write_page(
        &self,
        model_id: &str,
        model_version: &str,
        layer: u32,
        page_id: u64,
        data: &[u8],
    ) -> Result<()> {
        if data.len() as u64 != self.page_bytes {
            return Err(StoreError::InvalidRange(format!(
                "write_page expects exactly {} bytes, got {}",
                self.page_bytes,
                data.len()
            )));
        }
        let path = self.segment_path(model_id, model_version, layer);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::Io {
                    path: path.clone(),
                    source,
                })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        let offset = page_id * self.page_bytes;
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        file.write_all(data)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::trace!(%path, page_id, "wrote page");
        Ok(())
    }

    /// Returns `(offset, len)` for the range, or `(offset, 0)` when
    /// `page_end < page_start` — an inverted range reads as empty, not an
    /// error, since callers (e.g. the executor skipping a degenerate row)
    /// shouldn't have to special-case it.
    fn range_span(&self, page_start: u64, page_end: u64) -> (u64, u64) {
        let offset = page_start * self.page_bytes;
        if page_end < page_start {
            return (offset, 0);
        }
        let len = (page_end - page_start + 1) * self.page_bytes;
        (offset, len)
    }

    /// Reads one coalesced range of pages as a single positioned read,
    /// returning freshly allocated bytes.
    pub async fn read_range(
        &self,
        model_id: &str,
        model_version: &str,
        layer: u32,
        page_start: u64,
        page_end: u64,
    ) -> Result<Bytes> {
        let (_, len) = self.range_span(page_start, page_end);
        if len == 0 {
            return Ok(Bytes::new());
        }
        let mut buf = vec![0u8; len as usize];
        self.read_range_into(model_id, model_version, layer, page_start, page_end, &mut buf)
            .await?;
        Ok(Bytes::from(buf))
    }

    /// Reads one coalesced range of pages into a caller-supplied buffer
    /// (e.g. a pinned host buffer acquired from a copy engine), avoiding an
    /// extra allocation and copy on the hot prefetch path.
    pub async fn read_range_into(
        &self,
        model_id: &str,
        model_version: &str,
        layer: u32,
        page_start: u64,
        page_end: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let (offset, len) = self.range_span(page_start, page_end);
        if len == 0 {
            return Ok(());
        }
        if buf.len() as u64 != len {
            return Err(StoreError::InvalidRange(format!(
                "read_range_into buffer is {} bytes, expected {len}",
                buf.len()
            )));
        }
        let path = self.segment_path(model_id, model_version, layer);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        let actual_len = file
            .metadata()
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?
            .len();
        if actual_len < offset + len {
            return Err(StoreError::ShortSegment {
                path,
                expected: offset + len,
                actual: actual_len,
            });
        }
        file.seek(SeekFrom::Start(offset))
            .await
            .map_err(|source| StoreError::Io {
                path: path.clone(),
                source,
            })?;
        file.read_exact(buf).await.map_err(|source| StoreError::Io {
            path: path.clone(),
            source,
        })?;
        tracing::trace!(%path, page_start, page_end, len, "read coalesced range");
        Ok(())
    }
}

pub fn root_for(base: &Utf8Path) -> Utf8PathBuf {
    base.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(dir: &tempfile::TempDir) -> SegmentStore {
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        SegmentStore::new(root, 16)
    }

    #[tokio::test]
    async fn write_then_coalesced_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for (page, byte) in [(0u64, 1u8), (1, 2), (2, 3)] {
            let data = vec![byte; 16];
            store
                .write_page("m", "v1", 0, page, &data)
                .await
                .unwrap();
        }
        let got = store.read_range("m", "v1", 0, 0, 2).await.unwrap();
        assert_eq!(got.len(), 48);
        assert_eq!(&got[0..16], &[1u8; 16][..]);
        assert_eq!(&got[16..32], &[2u8; 16][..]);
        assert_eq!(&got[32..48], &[3u8; 16][..]);
    }

    #[tokio::test]
    async fn short_segment_is_reported_distinctly() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.write_page("m", "v1", 0, 0, &[9u8; 16]).await.unwrap();
        let err = store.read_range("m", "v1", 0, 0, 1).await.unwrap_err();
        assert!(matches!(err, StoreError::ShortSegment { .. }));
    }

    #[tokio::test]
    async fn read_range_into_rejects_mismatched_buffer_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.write_page("m", "v1", 0, 0, &[1u8; 16]).await.unwrap();
        let mut buf = vec![0u8; 8];
        let err = store
            .read_range_into("m", "v1", 0, 0, 0, &mut buf)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidRange(_)));
    }

    #[tokio::test]
    async fn an_inverted_range_reads_as_empty_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.write_page("m", "v1", 0, 0, &[1u8; 16]).await.unwrap();
        let got = store.read_range("m", "v1", 0, 3, 1).await.unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn segment_path_matches_the_documented_layout() {
        let store = SegmentStore::new(Utf8PathBuf::from("/data"), 1024);
        let path = store.segment_path("llama3-8b", "v1", 7);
        assert_eq!(path, Utf8PathBuf::from("/data/llama3-8b/v1/layer_7.seg"));
    }
}
