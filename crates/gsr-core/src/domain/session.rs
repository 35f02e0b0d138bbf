//! Recording session domain entity.
//!
//! A [`Session`] is one recording episode for one device.  It starts in
//! [`SessionState::Recording`], accumulates samples and sync marks in arrival
//! order, and ends in [`SessionState::Done`].  There are no other states and no
//! way back: a finished session is immutable.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::messages::Sample;
use crate::protocol::sequence::{SequenceObservation, SequenceTracker};

/// Device identifier as announced in the envelope `deviceId` field.
pub type DeviceId = String;

/// Globally unique session identifier.
pub type SessionId = String;

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Recording,
    Done,
}

/// Errors raised by the session entity itself.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionStateError {
    /// A mutation was attempted on a session that has already finished.
    #[error("session {0} is not recording")]
    NotRecording(SessionId),
}

/// A timestamped event annotation inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMark {
    pub mark_id: String,
    pub description: String,
    /// Controller wall clock when the mark was recorded.
    pub wall_clock: DateTime<Utc>,
    /// Controller monotonic clock when the mark was recorded, nanoseconds.
    pub monotonic_ns: u64,
}

/// One run of missing sequence numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    /// Sequence number that should have come next.
    pub expected: u64,
    /// Sequence number that actually arrived.
    pub received: u64,
    /// Index in `Session::samples` of the sample that revealed the gap.
    pub sample_index: usize,
}

impl SequenceGap {
    pub fn missing(&self) -> u64 {
        self.received - self.expected
    }
}

/// Data-quality observations accumulated while a session records.
///
/// Nothing here ever causes a sample to be rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionQuality {
    pub gaps: Vec<SequenceGap>,
    pub missing_samples: u64,
    pub out_of_order: u64,
    pub spike_flags: u64,
    pub saturation_flags: u64,
    pub dropout_flags: u64,
}

/// One recording episode for one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub device_id: DeviceId,
    pub name: String,
    pub participant_id: Option<String>,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub samples: Vec<Sample>,
    pub sync_marks: Vec<SyncMark>,
    /// Files the device uploaded while recording, in completion order.
    #[serde(default)]
    pub uploaded_files: Vec<String>,
    pub quality: SessionQuality,
    #[serde(skip)]
    tracker: SequenceTracker,
}

/// Lightweight view of a session without its sample buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub device_id: DeviceId,
    pub name: String,
    pub participant_id: Option<String>,
    pub state: SessionState,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub sample_count: usize,
    pub sync_mark_count: usize,
    pub missing_samples: u64,
}

impl Session {
    /// Creates a new session in [`SessionState::Recording`].
    pub fn start(
        id: impl Into<SessionId>,
        device_id: impl Into<DeviceId>,
        name: impl Into<String>,
        participant_id: Option<String>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Self {
            id: id.into(),
            device_id: device_id.into(),
            name: name.into(),
            participant_id,
            metadata,
            state: SessionState::Recording,
            started_at: Utc::now(),
            ended_at: None,
            samples: Vec::new(),
            sync_marks: Vec::new(),
            uploaded_files: Vec::new(),
            quality: SessionQuality::default(),
            tracker: SequenceTracker::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.state == SessionState::Recording
    }

    /// Appends `samples` in arrival order, recording gaps and flags.
    ///
    /// Returns how many samples were appended.
    ///
    /// # Errors
    ///
    /// [`SessionStateError::NotRecording`] if the session already finished;
    /// nothing is appended in that case.
    pub fn append_samples(&mut self, samples: Vec<Sample>) -> Result<usize, SessionStateError> {
        self.ensure_recording()?;

        let count = samples.len();
        self.samples.reserve(count);
        for sample in samples {
            let index = self.samples.len();
            match self.tracker.observe(sample.seq) {
                SequenceObservation::First | SequenceObservation::InOrder => {}
                SequenceObservation::Gap {
                    expected,
                    received,
                    missing,
                } => {
                    self.quality.gaps.push(SequenceGap {
                        expected,
                        received,
                        sample_index: index,
                    });
                    self.quality.missing_samples += missing;
                }
                SequenceObservation::OutOfOrder { .. } => self.quality.out_of_order += 1,
            }
            self.quality.spike_flags += u64::from(sample.flag_spike);
            self.quality.saturation_flags += u64::from(sample.flag_sat);
            self.quality.dropout_flags += u64::from(sample.flag_dropout);
            self.samples.push(sample);
        }
        Ok(count)
    }

    /// Appends a sync mark after any previously recorded ones.
    ///
    /// # Errors
    ///
    /// [`SessionStateError::NotRecording`] if the session already finished.
    pub fn add_sync_mark(&mut self, mark: SyncMark) -> Result<(), SessionStateError> {
        self.ensure_recording()?;
        self.sync_marks.push(mark);
        Ok(())
    }

    /// Notes a completed file upload.
    ///
    /// # Errors
    ///
    /// [`SessionStateError::NotRecording`] if the session already finished.
    pub fn add_uploaded_file(
        &mut self,
        file_name: impl Into<String>,
    ) -> Result<(), SessionStateError> {
        self.ensure_recording()?;
        self.uploaded_files.push(file_name.into());
        Ok(())
    }

    /// Moves the session to [`SessionState::Done`].
    ///
    /// # Errors
    ///
    /// [`SessionStateError::NotRecording`] if it was already done.
    pub fn finish(&mut self) -> Result<(), SessionStateError> {
        self.ensure_recording()?;
        self.state = SessionState::Done;
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            id: self.id.clone(),
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            participant_id: self.participant_id.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            sample_count: self.samples.len(),
            sync_mark_count: self.sync_marks.len(),
            missing_samples: self.quality.missing_samples,
        }
    }

    /// Copy of the session with an empty sample buffer.  Marks, uploads and
    /// quality counters are kept.
    pub fn without_samples(&self) -> Session {
        Session {
            id: self.id.clone(),
            device_id: self.device_id.clone(),
            name: self.name.clone(),
            participant_id: self.participant_id.clone(),
            metadata: self.metadata.clone(),
            state: self.state,
            started_at: self.started_at,
            ended_at: self.ended_at,
            samples: Vec::new(),
            sync_marks: self.sync_marks.clone(),
            uploaded_files: self.uploaded_files.clone(),
            quality: self.quality.clone(),
            tracker: self.tracker.clone(),
        }
    }

    fn ensure_recording(&self) -> Result<(), SessionStateError> {
        if self.is_recording() {
            Ok(())
        } else {
            Err(SessionStateError::NotRecording(self.id.clone()))
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64) -> Sample {
        Sample {
            t_mono_ns: seq as i64 * 1_000_000,
            t_utc_ns: 0,
            seq,
            gsr_raw: 1.0,
            gsr_filt: 1.0,
            temp: 32.0,
            flag_spike: false,
            flag_sat: false,
            flag_dropout: false,
        }
    }

    fn new_session() -> Session {
        Session::start("d1_1", "d1", "T1", None, BTreeMap::new())
    }

    fn mark(id: &str) -> SyncMark {
        SyncMark {
            mark_id: id.to_string(),
            description: format!("mark {id}"),
            wall_clock: Utc::now(),
            monotonic_ns: 0,
        }
    }

    #[test]
    fn test_new_session_is_recording_and_empty() {
        let s = new_session();
        assert_eq!(s.state, SessionState::Recording);
        assert!(s.samples.is_empty());
        assert!(s.ended_at.is_none());
    }

    #[test]
    fn test_append_keeps_arrival_order_even_when_sequence_goes_backwards() {
        // Arrange
        let mut s = new_session();

        // Act
        s.append_samples(vec![sample(1), sample(3), sample(2)]).unwrap();

        // Assert
        let seqs: Vec<u64> = s.samples.iter().map(|x| x.seq).collect();
        assert_eq!(seqs, vec![1, 3, 2]);
        assert_eq!(s.quality.out_of_order, 1);
        assert_eq!(s.quality.gaps.len(), 1);
    }

    #[test]
    fn test_gaps_are_recorded_not_rejected() {
        let mut s = new_session();
        s.append_samples(vec![sample(1), sample(2)]).unwrap();
        let appended = s.append_samples(vec![sample(10), sample(11)]).unwrap();

        assert_eq!(appended, 2);
        assert_eq!(s.samples.len(), 4);
        assert_eq!(s.quality.missing_samples, 7);
        assert_eq!(
            s.quality.gaps,
            vec![SequenceGap {
                expected: 3,
                received: 10,
                sample_index: 2
            }]
        );
        assert_eq!(s.quality.gaps[0].missing(), 7);
    }

    #[test]
    fn test_quality_flags_are_counted_independently() {
        let mut s = new_session();
        let mut flagged = sample(1);
        flagged.flag_spike = true;
        flagged.flag_sat = true;
        s.append_samples(vec![flagged]).unwrap();

        assert_eq!(s.quality.spike_flags, 1);
        assert_eq!(s.quality.saturation_flags, 1);
        assert_eq!(s.quality.dropout_flags, 0);
    }

    #[test]
    fn test_finished_session_rejects_mutation() {
        // Arrange
        let mut s = new_session();
        s.finish().unwrap();

        // Act
        let samples = s.append_samples(vec![sample(1)]);
        let marks = s.add_sync_mark(mark("A"));

        // Assert
        assert_eq!(samples, Err(SessionStateError::NotRecording("d1_1".into())));
        assert!(marks.is_err());
        assert!(s.add_uploaded_file("late.bin").is_err());
        assert!(s.samples.is_empty());
        assert!(s.uploaded_files.is_empty());
        assert_eq!(s.state, SessionState::Done);
        assert!(s.ended_at.is_some());
        assert!(s.finish().is_err());
    }

    #[test]
    fn test_sync_marks_keep_insertion_order() {
        let mut s = new_session();
        for id in ["A", "B", "C", "D"] {
            s.add_sync_mark(mark(id)).unwrap();
        }
        let ids: Vec<&str> = s.sync_marks.iter().map(|m| m.mark_id.as_str()).collect();
        assert_eq!(ids, vec!["A", "B", "C", "D"]);
    }

    #[test]
    fn test_without_samples_keeps_everything_else() {
        // Arrange
        let mut s = new_session();
        s.append_samples(vec![sample(1), sample(5)]).unwrap();
        s.add_sync_mark(mark("A")).unwrap();
        s.finish().unwrap();

        // Act
        let bare = s.without_samples();

        // Assert
        assert!(bare.samples.is_empty());
        assert_eq!(bare.id, s.id);
        assert_eq!(bare.state, SessionState::Done);
        assert_eq!(bare.sync_marks, s.sync_marks);
        assert_eq!(bare.quality, s.quality);
        assert_eq!(bare.ended_at, s.ended_at);
    }

    #[test]
    fn test_summary_reflects_counts() {
        let mut s = new_session();
        s.append_samples(vec![sample(1), sample(2), sample(4)]).unwrap();
        s.add_sync_mark(mark("A")).unwrap();

        let summary = s.summary();
        assert_eq!(summary.sample_count, 3);
        assert_eq!(summary.sync_mark_count, 1);
        assert_eq!(summary.missing_samples, 1);
        assert_eq!(summary.state, SessionState::Recording);
    }
}
