//! Thread checkpoints
//!
//! A thread is posted one segment at a time, each segment replying to the
//! previous one. After every confirmed segment the handler persists a
//! [`ThreadProgress`] so a retry resumes at exactly `posted` instead of
//! re-posting from the beginning.
//!
//! Checkpoints are versioned and validated on every read and write. A
//! checkpoint that does not validate is an error, never silently reset.

use serde::{Deserialize, Serialize};

use crate::error::CheckpointError;

/// Current checkpoint schema version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// Durable progress of a multi-segment post on one platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadProgress {
    pub version: u32,
    pub posted: usize,
    pub total: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_posted_id: Option<String>,
    /// External ids in submission order. Named after the first platform that had threads.
    pub tweet_ids: Vec<String>,
}

/// Where a thread stands, derived from its checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    NotStarted,
    InProgress(usize),
    Completed,
}

impl ThreadProgress {
    pub fn new(total: usize) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            posted: 0,
            total,
            last_posted_id: None,
            tweet_ids: Vec::new(),
        }
    }

    pub fn state(&self) -> ThreadState {
        match self.posted {
            0 => ThreadState::NotStarted,
            n if n >= self.total => ThreadState::Completed,
            n => ThreadState::InProgress(n),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state() == ThreadState::Completed
    }

    /// Id the next segment must reply to.
    pub fn reply_target(&self) -> Option<&str> {
        self.last_posted_id.as_deref()
    }

    pub fn contains(&self, external_id: &str) -> bool {
        self.tweet_ids.iter().any(|id| id == external_id)
    }

    /// Record a confirmed segment. Only ever moves forward.
    pub fn advance(&mut self, external_id: impl Into<String>) -> Result<(), CheckpointError> {
        if self.is_complete() {
            return Err(CheckpointError::AlreadyComplete(self.total));
        }
        let external_id = external_id.into();
        if external_id.is_empty() {
            return Err(CheckpointError::Malformed(
                "segment confirmed with an empty id".to_string(),
            ));
        }
        self.tweet_ids.push(external_id.clone());
        self.last_posted_id = Some(external_id);
        self.posted += 1;
        self.validate()
    }

    /// Structural invariants: `tweet_ids.len() == posted <= total` and the
    /// last id matches `last_posted_id`.
    pub fn validate(&self) -> Result<(), CheckpointError> {
        if self.version != CHECKPOINT_VERSION {
            return Err(CheckpointError::UnsupportedVersion {
                found: self.version,
                expected: CHECKPOINT_VERSION,
            });
        }
        if self.total == 0 {
            return Err(CheckpointError::Malformed("total must be positive".to_string()));
        }
        if self.tweet_ids.len() != self.posted {
            return Err(CheckpointError::Malformed(format!(
                "posted is {} but {} ids are recorded",
                self.posted,
                self.tweet_ids.len()
            )));
        }
        if self.posted > self.total {
            return Err(CheckpointError::Malformed(format!(
                "posted {} exceeds total {}",
                self.posted, self.total
            )));
        }
        if self.tweet_ids.last().map(String::as_str) != self.last_posted_id.as_deref() {
            return Err(CheckpointError::Malformed(
                "lastPostedId does not match the last recorded id".to_string(),
            ));
        }
        Ok(())
    }

    /// Check the checkpoint belongs to a thread of `expected` segments.
    pub fn ensure_total(&self, expected: usize) -> Result<(), CheckpointError> {
        if self.total != expected {
            return Err(CheckpointError::TotalMismatch {
                found: self.total,
                expected,
            });
        }
        Ok(())
    }

    /// Parse and validate a stored checkpoint.
    pub fn from_value(value: &serde_json::Value) -> Result<Self, CheckpointError> {
        let progress: ThreadProgress = serde_json::from_value(value.clone())
            .map_err(|e| CheckpointError::Malformed(e.to_string()))?;
        progress.validate()?;
        Ok(progress)
    }

    /// Validate and serialize for storage.
    pub fn to_value(&self) -> Result<serde_json::Value, CheckpointError> {
        self.validate()?;
        serde_json::to_value(self).map_err(|e| CheckpointError::Malformed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_checkpoint_is_not_started() {
        let progress = ThreadProgress::new(3);
        assert_eq!(progress.state(), ThreadState::NotStarted);
        assert!(progress.reply_target().is_none());
        progress.validate().unwrap();
    }

    #[test]
    fn test_advance_moves_through_states() {
        let mut progress = ThreadProgress::new(2);
        progress.advance("100").unwrap();
        assert_eq!(progress.state(), ThreadState::InProgress(1));
        assert_eq!(progress.reply_target(), Some("100"));

        progress.advance("101").unwrap();
        assert_eq!(progress.state(), ThreadState::Completed);
        assert_eq!(progress.tweet_ids, vec!["100", "101"]);

        assert_eq!(
            progress.advance("102"),
            Err(CheckpointError::AlreadyComplete(2))
        );
    }

    #[test]
    fn test_serializes_camel_case() {
        let mut progress = ThreadProgress::new(2);
        progress.advance("1").unwrap();
        let value = progress.to_value().unwrap();
        assert_eq!(
            value,
            json!({"version": 1, "posted": 1, "total": 2, "lastPostedId": "1", "tweetIds": ["1"]})
        );
    }

    #[test]
    fn test_rejects_length_mismatch() {
        let value = json!({"version": 1, "posted": 2, "total": 3, "lastPostedId": "a", "tweetIds": ["a"]});
        assert!(matches!(
            ThreadProgress::from_value(&value),
            Err(CheckpointError::Malformed(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_version() {
        let value = json!({"version": 7, "posted": 0, "total": 3, "tweetIds": []});
        assert_eq!(
            ThreadProgress::from_value(&value),
            Err(CheckpointError::UnsupportedVersion {
                found: 7,
                expected: CHECKPOINT_VERSION
            })
        );
    }

    #[test]
    fn test_rejects_untyped_blob() {
        let value = json!({"posted": "two"});
        assert!(ThreadProgress::from_value(&value).is_err());
    }

    #[test]
    fn test_rejects_stale_last_id() {
        let value = json!({"version": 1, "posted": 1, "total": 3, "lastPostedId": "b", "tweetIds": ["a"]});
        assert!(ThreadProgress::from_value(&value).is_err());
    }

    #[test]
    fn test_total_mismatch_detected() {
        let progress = ThreadProgress::new(3);
        assert_eq!(
            progress.ensure_total(4),
            Err(CheckpointError::TotalMismatch {
                found: 3,
                expected: 4
            })
        );
    }
}
