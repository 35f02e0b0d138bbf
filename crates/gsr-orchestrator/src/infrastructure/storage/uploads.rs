//! Chunked file uploads from devices.
//!
//! A device announces a file with `UPLOAD_BEGIN`, sends it as base64
//! `UPLOAD_CHUNK`s (in any order), and finishes with a chunk flagged
//! `isLast` or an explicit `UPLOAD_END`.  Chunks are written straight to a
//! hidden `.<name>.part` file at their offset, so memory use does not grow
//! with the file.  On finish the size and SHA-256 are checked and the part
//! file is renamed into place.
//!
//! One [`UploadTracker`] belongs to one connection.  Unfinished part files
//! are removed when the connection goes away.

use std::collections::{BTreeSet, HashMap};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use gsr_core::protocol::{error_code, is_safe_name, UploadBeginPayload, UploadChunkPayload};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::application::error_recovery::{ClassifiedError, ErrorCategory};
use crate::infrastructure::storage::session_export::ExportError;

/// Uploads one connection may have open at once.
pub const MAX_PENDING_UPLOADS: usize = 8;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("uploads are disabled: no export directory configured")]
    Disabled,

    #[error("no upload in progress for '{0}'")]
    NotFound(String),

    #[error("'{0}' is not a valid upload file name")]
    InvalidFileName(String),

    #[error("'{file}' is {size} bytes, the limit is {limit}")]
    TooLarge { file: String, size: u64, limit: u64 },

    #[error("too many uploads in progress ({0})")]
    TooManyPending(usize),

    #[error("'{0}' announces a zero chunk size")]
    InvalidChunkSize(String),

    #[error("'{file}': sha256 must be 64 hex digits")]
    InvalidChecksum { file: String },

    #[error("chunk {index} of '{file}' is not valid base64: {source}")]
    Encoding {
        file: String,
        index: u32,
        #[source]
        source: base64::DecodeError,
    },

    #[error("chunk {index} of '{file}' lies outside the announced size")]
    ChunkOutOfRange { file: String, index: u32 },

    #[error("'{file}': received {received} of {expected} chunks")]
    MissingChunks {
        file: String,
        received: usize,
        expected: u64,
    },

    #[error("'{file}': expected {expected} bytes, received {actual}")]
    SizeMismatch {
        file: String,
        expected: u64,
        actual: u64,
    },

    #[error("'{file}': checksum mismatch, expected {expected}, computed {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },

    #[error(transparent)]
    Directory(#[from] ExportError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UploadError {
    /// `code` carried in the `ERROR` envelope.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::NotFound(_) => error_code::UPLOAD_NOT_FOUND,
            UploadError::MissingChunks { .. } | UploadError::SizeMismatch { .. } => {
                error_code::SIZE_MISMATCH
            }
            UploadError::ChecksumMismatch { .. } => error_code::CHECKSUM_MISMATCH,
            _ => error_code::UPLOAD_FAILED,
        }
    }
}

impl ClassifiedError for UploadError {
    fn error_type(&self) -> &'static str {
        match self {
            UploadError::Io { .. } => "FileError",
            _ => "UploadRejected",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            UploadError::Io { .. } => ErrorCategory::Internal,
            _ => ErrorCategory::Validation,
        }
    }
}

/// A file that passed its size and checksum checks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedUpload {
    pub file_name: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks: u32,
}

#[derive(Debug)]
struct PendingUpload {
    dir: PathBuf,
    part_path: PathBuf,
    file: File,
    file_size: u64,
    chunk_size: u32,
    sha256: Vec<u8>,
    received: BTreeSet<u32>,
}

impl PendingUpload {
    fn expected_chunks(&self) -> u64 {
        if self.file_size == 0 {
            0
        } else {
            self.file_size.div_ceil(u64::from(self.chunk_size))
        }
    }
}

/// Open uploads of one connection, keyed by file name.
#[derive(Debug)]
pub struct UploadTracker {
    max_file_size: u64,
    pending: HashMap<String, PendingUpload>,
}

impl UploadTracker {
    pub fn new(max_file_size: u64) -> Self {
        Self {
            max_file_size,
            pending: HashMap::new(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Opens `<dir>/.<file>.part` for an announced upload.  Announcing a
    /// name that is already open restarts it.
    ///
    /// # Errors
    ///
    /// Validation failures for the name, size, chunk size or checksum, and
    /// [`UploadError::Io`] if the part file cannot be created.
    pub async fn begin(
        &mut self,
        dir: &Path,
        begin: &UploadBeginPayload,
    ) -> Result<(), UploadError> {
        let name = &begin.file_name;
        if !is_safe_name(name) {
            return Err(UploadError::InvalidFileName(name.clone()));
        }
        if begin.file_size > self.max_file_size {
            return Err(UploadError::TooLarge {
                file: name.clone(),
                size: begin.file_size,
                limit: self.max_file_size,
            });
        }
        if begin.chunk_size == 0 && begin.file_size > 0 {
            return Err(UploadError::InvalidChunkSize(name.clone()));
        }
        let sha256 = match hex::decode(&begin.sha256) {
            Ok(bytes) if bytes.len() == 32 => bytes,
            _ => return Err(UploadError::InvalidChecksum { file: name.clone() }),
        };

        if let Some(previous) = self.pending.remove(name) {
            warn!("upload of '{name}' restarted before it finished");
            discard(previous).await;
        }
        if self.pending.len() >= MAX_PENDING_UPLOADS {
            return Err(UploadError::TooManyPending(self.pending.len()));
        }

        tokio::fs::create_dir_all(dir).await.map_err(|source| UploadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let part_path = dir.join(format!(".{name}.part"));
        let file = File::create(&part_path).await.map_err(|source| UploadError::Io {
            path: part_path.clone(),
            source,
        })?;

        debug!(
            "upload of '{name}' begun: {} bytes in chunks of {}",
            begin.file_size, begin.chunk_size
        );
        self.pending.insert(
            name.clone(),
            PendingUpload {
                dir: dir.to_path_buf(),
                part_path,
                file,
                file_size: begin.file_size,
                chunk_size: begin.chunk_size,
                sha256,
                received: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Writes one chunk at its offset.  A chunk flagged `is_last` also
    /// finishes the upload and returns the completed file.
    ///
    /// # Errors
    ///
    /// [`UploadError::NotFound`] without a matching `UPLOAD_BEGIN`, encoding
    /// and range errors for a bad chunk (the upload stays open), and every
    /// error of [`Self::finish`] for a last chunk.
    pub async fn write_chunk(
        &mut self,
        chunk: &UploadChunkPayload,
    ) -> Result<Option<CompletedUpload>, UploadError> {
        let name = &chunk.file_name;
        let upload = self
            .pending
            .get_mut(name)
            .ok_or_else(|| UploadError::NotFound(name.clone()))?;

        let data = base64::engine::general_purpose::STANDARD
            .decode(&chunk.data)
            .map_err(|source| UploadError::Encoding {
                file: name.clone(),
                index: chunk.chunk_index,
                source,
            })?;

        let offset = u64::from(chunk.chunk_index) * u64::from(upload.chunk_size);
        let fits = data.len() as u64 <= u64::from(upload.chunk_size)
            && offset + data.len() as u64 <= upload.file_size;
        if !fits {
            return Err(UploadError::ChunkOutOfRange {
                file: name.clone(),
                index: chunk.chunk_index,
            });
        }

        let io_err = |source| UploadError::Io {
            path: upload.part_path.clone(),
            source,
        };
        upload
            .file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(io_err)?;
        upload.file.write_all(&data).await.map_err(io_err)?;
        upload.received.insert(chunk.chunk_index);

        if chunk.is_last {
            self.finish(name).await.map(Some)
        } else {
            Ok(None)
        }
    }

    /// Verifies and stores an upload.  The upload is closed whatever the
    /// outcome; a failed file is deleted.
    ///
    /// # Errors
    ///
    /// [`UploadError::NotFound`], [`UploadError::MissingChunks`],
    /// [`UploadError::SizeMismatch`], [`UploadError::ChecksumMismatch`] or
    /// [`UploadError::Io`].
    pub async fn finish(&mut self, file_name: &str) -> Result<CompletedUpload, UploadError> {
        let mut upload = self
            .pending
            .remove(file_name)
            .ok_or_else(|| UploadError::NotFound(file_name.to_string()))?;

        if let Err(e) = verify(file_name, &mut upload).await {
            warn!("upload of '{file_name}' rejected: {e}");
            discard(upload).await;
            return Err(e);
        }

        let bytes = upload.file_size;
        let chunks = upload.received.len() as u32;
        let final_path = upload.dir.join(file_name);
        let PendingUpload { file, part_path, .. } = upload;
        drop(file);
        tokio::fs::rename(&part_path, &final_path)
            .await
            .map_err(|source| UploadError::Io {
                path: final_path.clone(),
                source,
            })?;

        info!(
            "upload of '{file_name}' complete: {bytes} bytes in {chunks} chunk(s) at {}",
            final_path.display()
        );
        Ok(CompletedUpload {
            file_name: file_name.to_string(),
            path: final_path,
            bytes,
            chunks,
        })
    }

    /// Deletes every unfinished part file.
    pub async fn abort_all(&mut self) {
        for (name, upload) in self.pending.drain() {
            debug!("abandoning unfinished upload of '{name}'");
            discard(upload).await;
        }
    }
}

async fn verify(file_name: &str, upload: &mut PendingUpload) -> Result<(), UploadError> {
    let expected = upload.expected_chunks();
    let received = upload
        .received
        .iter()
        .filter(|&&i| u64::from(i) < expected)
        .count();
    if received as u64 != expected {
        return Err(UploadError::MissingChunks {
            file: file_name.to_string(),
            received,
            expected,
        });
    }

    let io_err = |source| UploadError::Io {
        path: upload.part_path.clone(),
        source,
    };
    upload.file.flush().await.map_err(io_err)?;
    let actual = upload.file.metadata().await.map_err(io_err)?.len();
    if actual != upload.file_size {
        return Err(UploadError::SizeMismatch {
            file: file_name.to_string(),
            expected: upload.file_size,
            actual,
        });
    }

    let digest = sha256_of(&upload.part_path).await?;
    if digest.as_slice() != upload.sha256.as_slice() {
        return Err(UploadError::ChecksumMismatch {
            file: file_name.to_string(),
            expected: hex::encode(&upload.sha256),
            actual: hex::encode(digest),
        });
    }
    Ok(())
}

async fn sha256_of(path: &Path) -> Result<Vec<u8>, UploadError> {
    let io_err = |source| UploadError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).await.map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(io_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

async fn discard(upload: PendingUpload) {
    let PendingUpload { file, part_path, .. } = upload;
    drop(file);
    if let Err(e) = tokio::fs::remove_file(&part_path).await {
        debug!("could not remove {}: {e}", part_path.display());
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
