//! Stream provisioning.
//!
//! Streams are created on demand and their subject lists only ever grow:
//! a requested subject that is missing gets appended, existing subjects are
//! never removed or reordered.

use crate::config::{FunctionConfig, RetentionPolicy, StorageType};
use crate::error::FunctionError;
use crate::session::{Session, StreamSpec};
use tracing::{debug, info};

/// Outcome of a provisioning call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioned {
    /// The stream did not exist and was created.
    Created,
    /// The stream existed and was given these additional subjects.
    Extended(Vec<String>),
    /// The stream already had every requested subject.
    Unchanged,
}

/// Creates streams and merges subjects into existing ones.
#[derive(Debug, Clone, Copy)]
pub struct StreamProvisioner {
    retention: RetentionPolicy,
    storage: StorageType,
}

impl StreamProvisioner {
    pub fn new(retention: RetentionPolicy, storage: StorageType) -> Self {
        Self { retention, storage }
    }

    pub fn from_config(config: &FunctionConfig) -> Self {
        Self::new(config.retention, config.storage)
    }

    /// Ensure `name` exists and captures every subject in `subjects`.
    ///
    /// Without subjects the stream captures its own name. An empty list is
    /// treated the same as no list.
    pub async fn ensure_stream<S: Session + ?Sized>(
        &self,
        session: &S,
        name: &str,
        subjects: Option<&[String]>,
    ) -> Result<Provisioned, FunctionError> {
        let requested = requested_subjects(name, subjects);

        match session.stream_subjects(name).await? {
            Some(existing) => self.merge(session, name, existing, &requested).await,
            None => {
                let spec = StreamSpec {
                    name: name.to_string(),
                    subjects: requested.clone(),
                    retention: self.retention,
                    storage: self.storage,
                };
                match session.create_stream(spec).await {
                    Ok(()) => {
                        info!(stream = %name, subjects = ?requested, "Created stream");
                        Ok(Provisioned::Created)
                    }
                    Err(FunctionError::AlreadyExists(_)) => {
                        // Someone else created it between lookup and create
                        debug!(stream = %name, "Stream appeared concurrently, merging subjects");
                        let existing = session
                            .stream_subjects(name)
                            .await?
                            .ok_or_else(|| {
                                FunctionError::provisioning(name, "stream vanished after create")
                            })?;
                        self.merge(session, name, existing, &requested).await
                    }
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Provision several streams in order, stopping at the first failure.
    pub async fn ensure_streams<S: Session + ?Sized>(
        &self,
        session: &S,
        names: &[String],
        subjects: Option<&[String]>,
    ) -> Result<(), FunctionError> {
        for name in names {
            self.ensure_stream(session, name, subjects).await?;
        }
        Ok(())
    }

    async fn merge<S: Session + ?Sized>(
        &self,
        session: &S,
        name: &str,
        existing: Vec<String>,
        requested: &[String],
    ) -> Result<Provisioned, FunctionError> {
        let (merged, added) = merge_subjects(existing, requested);
        if added.is_empty() {
            debug!(stream = %name, "Stream already has all subjects");
            return Ok(Provisioned::Unchanged);
        }

        session.update_stream_subjects(name, merged).await?;
        info!(stream = %name, added = ?added, "Added subjects to stream");
        Ok(Provisioned::Extended(added))
    }
}

fn requested_subjects(name: &str, subjects: Option<&[String]>) -> Vec<String> {
    match subjects {
        Some(list) if !list.is_empty() => {
            let mut unique: Vec<String> = Vec::with_capacity(list.len());
            for subject in list {
                if !unique.contains(subject) {
                    unique.push(subject.clone());
                }
            }
            unique
        }
        _ => vec![name.to_string()],
    }
}

/// Append requested subjects missing from `existing`.
///
/// Returns the merged list and the subjects that were added.
fn merge_subjects(existing: Vec<String>, requested: &[String]) -> (Vec<String>, Vec<String>) {
    let mut merged = existing;
    let mut added = Vec::new();
    for subject in requested {
        if !merged.contains(subject) {
            merged.push(subject.clone());
            added.push(subject.clone());
        }
    }
    (merged, added)
}
