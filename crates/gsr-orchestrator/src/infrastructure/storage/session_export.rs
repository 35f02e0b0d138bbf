//! Writes finished sessions to disk as structured records.
//!
//! Layout under the configured export directory:
//!
//! ```text
//! <export_dir>/<session_id>/
//!     session.json       manifest: identity, timing, metadata, quality
//!     samples.jsonl      one Sample per line, arrival order
//!     sync_marks.jsonl   one SyncMark per line, insertion order
//!     uploads/           files the device uploaded while recording
//! <export_dir>/<device_id>_uploads/
//!                        files uploaded with no session recording
//! ```
//!
//! JSON Lines keeps large sample streams appendable and easy to load in
//! analysis tools one record at a time.
//!
//! Directory names come from device-supplied ids, so every name is mapped
//! through [`safe_component`] before it is joined onto the root.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use gsr_core::{Session, SessionQuality, SessionState};
use serde::Serialize;
use thiserror::Error;
use tracing::info;

use crate::application::time_sync::ClockOffset;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize session record: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Only finished sessions are exported.
    #[error("session {0} is still recording")]
    StillRecording(String),

    #[error("'{0}' cannot be used as a directory name")]
    InvalidName(String),
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    id: &'a str,
    device_id: &'a str,
    name: &'a str,
    participant_id: Option<&'a str>,
    metadata: &'a BTreeMap<String, serde_json::Value>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    sample_count: usize,
    sync_mark_count: usize,
    uploaded_files: &'a [String],
    quality: &'a SessionQuality,
    /// Device clock estimate at export time, for mapping `t_mono_ns`.
    clock_offset: Option<ClockOffset>,
    exported_at: DateTime<Utc>,
}

/// Exports `session` into `<root>/<session id>/`.  Returns the directory.
///
/// # Errors
///
/// [`ExportError::StillRecording`] for an active session, otherwise I/O or
/// serialization failures.
pub fn export_session(
    root: &Path,
    session: &Session,
    clock_offset: Option<ClockOffset>,
) -> Result<PathBuf, ExportError> {
    if session.state != SessionState::Done {
        return Err(ExportError::StillRecording(session.id.clone()));
    }

    let dir = session_dir(root, &session.id)?;
    std::fs::create_dir_all(&dir).map_err(|source| ExportError::Io {
        path: dir.clone(),
        source,
    })?;

    let manifest = Manifest {
        id: &session.id,
        device_id: &session.device_id,
        name: &session.name,
        participant_id: session.participant_id.as_deref(),
        metadata: &session.metadata,
        started_at: session.started_at,
        ended_at: session.ended_at,
        sample_count: session.samples.len(),
        sync_mark_count: session.sync_marks.len(),
        uploaded_files: &session.uploaded_files,
        quality: &session.quality,
        clock_offset,
        exported_at: Utc::now(),
    };
    let manifest_path = dir.join("session.json");
    let json = serde_json::to_vec_pretty(&manifest)?;
    std::fs::write(&manifest_path, json).map_err(|source| ExportError::Io {
        path: manifest_path,
        source,
    })?;

    write_lines(&dir.join("samples.jsonl"), &session.samples)?;
    write_lines(&dir.join("sync_marks.jsonl"), &session.sync_marks)?;

    info!(
        "exported session {} ({} samples) to {}",
        session.id,
        session.samples.len(),
        dir.display()
    );
    Ok(dir)
}

/// Maps `name` onto a single path component.  Characters outside
/// `[A-Za-z0-9._-]` become `_`; `None` if the result would be empty or
/// made only of dots.
pub fn safe_component(name: &str) -> Option<String> {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.chars().all(|c| c == '.') {
        None
    } else {
        Some(cleaned)
    }
}

/// Export directory of one session, always a direct child of `root`.
///
/// # Errors
///
/// [`ExportError::InvalidName`] if the id has no usable characters.
pub fn session_dir(root: &Path, session_id: &str) -> Result<PathBuf, ExportError> {
    safe_component(session_id)
        .map(|name| root.join(name))
        .ok_or_else(|| ExportError::InvalidName(session_id.to_string()))
}

/// Where a device's uploads land: inside the recording session's
/// directory, or a per-device directory when nothing is recording.
///
/// # Errors
///
/// [`ExportError::InvalidName`] if the id has no usable characters.
pub fn upload_dir(
    root: &Path,
    device_id: &str,
    session_id: Option<&str>,
) -> Result<PathBuf, ExportError> {
    match session_id {
        Some(id) => Ok(session_dir(root, id)?.join("uploads")),
        None => session_dir(root, &format!("{device_id}_uploads")),
    }
}

fn write_lines<T: Serialize>(path: &Path, records: &[T]) -> Result<(), ExportError> {
    let io_err = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut out = BufWriter::new(File::create(path).map_err(io_err)?);
    for record in records {
        serde_json::to_writer(&mut out, record)?;
        out.write_all(b"\n").map_err(io_err)?;
    }
    out.flush().map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gsr_core::{Sample, SyncMark};

    fn sample(seq: u64) -> Sample {
        Sample {
            t_mono_ns: seq as i64 * 1_000_000,
            t_utc_ns: 1_700_000_000_000_000_000 + seq as i64,
            seq,
            gsr_raw: 2.5,
            gsr_filt: 2.25,
            temp: 33.125,
            flag_spike: false,
            flag_sat: false,
            flag_dropout: false,
        }
    }

    fn finished_session() -> Session {
        let mut session = Session::start(
            "dev-a_1_abcd1234".to_string(),
            "dev-a",
            "baseline",
            Some("P01".to_string()),
            BTreeMap::new(),
        );
        session.append_samples((0..5).map(sample).collect()).unwrap();
        session
            .add_sync_mark(SyncMark {
                mark_id: "m1".to_string(),
                description: "stimulus".to_string(),
                wall_clock: Utc::now(),
                monotonic_ns: 42,
            })
            .unwrap();
        session.finish().unwrap();
        session
    }

    #[test]
    fn test_export_writes_manifest_and_record_files() {
        // Arrange
        let root = tempfile::tempdir().unwrap();
        let session = finished_session();

        // Act
        let dir = export_session(root.path(), &session, None).unwrap();

        // Assert
        assert_eq!(dir, root.path().join("dev-a_1_abcd1234"));
        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("session.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["device_id"], "dev-a");
        assert_eq!(manifest["participant_id"], "P01");
        assert_eq!(manifest["sample_count"], 5);
        assert!(manifest["clock_offset"].is_null());
    }

    #[test]
    fn test_samples_are_written_one_per_line_in_order() {
        let root = tempfile::tempdir().unwrap();
        let dir = export_session(root.path(), &finished_session(), None).unwrap();

        let content = std::fs::read_to_string(dir.join("samples.jsonl")).unwrap();
        let seqs: Vec<u64> = content
            .lines()
            .map(|line| serde_json::from_str::<Sample>(line).unwrap().seq)
            .collect();

        assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_sync_marks_file_contains_marks() {
        let root = tempfile::tempdir().unwrap();
        let dir = export_session(root.path(), &finished_session(), None).unwrap();

        let content = std::fs::read_to_string(dir.join("sync_marks.jsonl")).unwrap();
        let marks: Vec<SyncMark> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(marks.len(), 1);
        assert_eq!(marks[0].mark_id, "m1");
    }

    #[test]
    fn test_recording_session_is_not_exported() {
        let root = tempfile::tempdir().unwrap();
        let session = Session::start(
            "dev-a_2_00000000".to_string(),
            "dev-a",
            "live",
            None,
            BTreeMap::new(),
        );

        let result = export_session(root.path(), &session, None);

        assert!(matches!(result, Err(ExportError::StillRecording(_))));
        assert!(!root.path().join("dev-a_2_00000000").exists());
    }

    #[test]
    fn test_export_stays_under_root_for_path_like_ids() {
        // Arrange
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let hostile_device = format!("{}/evil", elsewhere.path().display());
        let mut session = Session::start(
            format!("{hostile_device}_1_abcd1234"),
            hostile_device,
            "escape",
            None,
            BTreeMap::new(),
        );
        session.finish().unwrap();

        // Act
        let dir = export_session(root.path(), &session, None).unwrap();

        // Assert
        assert_eq!(dir.parent(), Some(root.path()));
        assert!(dir.join("session.json").exists());
        assert_eq!(std::fs::read_dir(elsewhere.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_safe_component_replaces_separators_and_rejects_dots() {
        assert_eq!(safe_component("dev-a_1_ff"), Some("dev-a_1_ff".to_string()));
        assert_eq!(safe_component("../x"), Some(".._x".to_string()));
        assert_eq!(safe_component("a\\b c"), Some("a_b_c".to_string()));
        assert_eq!(safe_component(".."), None);
        assert_eq!(safe_component(""), None);
        assert!(matches!(
            session_dir(Path::new("/data"), "."),
            Err(ExportError::InvalidName(_))
        ));
    }

    #[test]
    fn test_upload_dir_prefers_the_recording_session() {
        let root = Path::new("/data");
        assert_eq!(
            upload_dir(root, "dev-a", Some("dev-a_1_ff")).unwrap(),
            root.join("dev-a_1_ff").join("uploads")
        );
        assert_eq!(
            upload_dir(root, "dev-a", None).unwrap(),
            root.join("dev-a_uploads")
        );
    }

    #[test]
    fn test_manifest_lists_uploaded_files() {
        let root = tempfile::tempdir().unwrap();
        let mut session = Session::start("dev-a_3_00", "dev-a", "clip", None, BTreeMap::new());
        session.add_uploaded_file("camera.mp4").unwrap();
        session.finish().unwrap();

        let dir = export_session(root.path(), &session, None).unwrap();

        let manifest: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(dir.join("session.json")).unwrap())
                .unwrap();
        assert_eq!(manifest["uploaded_files"], serde_json::json!(["camera.mp4"]));
    }
}
