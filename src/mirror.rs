use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{RetryPolicy, SkipPolicy};
use crate::domain::{MetadataRecord, MirroredFile, RemoteFile, VerificationState};
use crate::error::MirrorError;
use crate::integrity::{IntegrityChecker, Verification};
use crate::store::MirrorStore;
use crate::transport::Transport;

/// Shared flag checked before each file; set it to stop after the current one.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileAction {
    Skipped,
    Fetched,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileOutcome {
    pub run_accession: String,
    pub locator: String,
    pub file: MirroredFile,
    pub action: FileAction,
    pub attempts: u32,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MirrorReport {
    pub files: Vec<FileOutcome>,
    pub cancelled: bool,
}

impl MirrorReport {
    pub fn count(&self, action: FileAction) -> usize {
        self.files.iter().filter(|file| file.action == action).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &FileOutcome> {
        self.files
            .iter()
            .filter(|file| file.action == FileAction::Failed)
    }

    pub fn is_complete(&self) -> bool {
        !self.cancelled && self.failures().next().is_none()
    }

    pub fn merge(&mut self, other: MirrorReport) {
        self.files.extend(other.files);
        self.cancelled |= other.cancelled;
    }
}

/// Brings remote files into the mirror tree and proves they are intact.
pub struct MirrorEngine<T: Transport> {
    store: MirrorStore,
    transport: T,
    retry: RetryPolicy,
    skip_policy: SkipPolicy,
    cancel: CancelToken,
}

impl<T: Transport> MirrorEngine<T> {
    pub fn new(
        store: MirrorStore,
        transport: T,
        retry: RetryPolicy,
        skip_policy: SkipPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            retry,
            skip_policy,
            cancel: CancelToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Expands every record into its remote files, rejecting malformed records
    /// before anything is fetched.
    pub fn plan(records: &[MetadataRecord]) -> Result<Vec<RemoteFile>, MirrorError> {
        let mut files = Vec::new();
        for record in records {
            files.extend(record.remote_files()?);
        }
        Ok(files)
    }

    /// Mirrors every file of the record set.
    ///
    /// Per-file transfer and integrity problems are collected in the report and
    /// never stop the batch. Malformed records fail the whole call up front.
    pub fn mirror_all(&self, records: &[MetadataRecord]) -> Result<MirrorReport, MirrorError> {
        let files = Self::plan(records)?;
        self.store.ensure_mirror_base()?;

        let total = files.len();
        let mut report = MirrorReport::default();
        for (index, remote) in files.iter().enumerate() {
            if self.cancel.is_cancelled() {
                warn!(remaining = total - index, "mirroring cancelled");
                report.cancelled = true;
                break;
            }
            info!(index = index + 1, total, locator = %remote.locator, "processing file");
            report.files.push(self.mirror_file(remote));
        }

        let failed = report.count(FileAction::Failed);
        if failed > 0 {
            for outcome in report.failures() {
                error!(
                    run = %outcome.run_accession,
                    locator = %outcome.locator,
                    error = outcome.error.as_deref().unwrap_or_default(),
                    "file left unmirrored"
                );
            }
            warn!(failed, total, "some files could not be mirrored");
        }
        Ok(report)
    }

    /// Runs the skip check and then the fetch/verify loop for one file.
    pub fn mirror_file(&self, remote: &RemoteFile) -> FileOutcome {
        let destination = self.store.mirror_path(&remote.locator);
        let mut file = MirroredFile::new(destination.as_std_path(), remote);
        let _guard = self.store.lock(&destination);

        let outcome = |file: MirroredFile, action, attempts, error: Option<String>| FileOutcome {
            run_accession: remote.run_accession.clone(),
            locator: remote.locator.to_string(),
            file,
            action,
            attempts,
            error,
        };

        match self.reuse_existing(&destination, remote) {
            Ok(Some(state)) => {
                file.state = state;
                return outcome(file, FileAction::Skipped, 0, None);
            }
            Ok(None) => {}
            Err(err) => {
                file.state = VerificationState::Invalid;
                return outcome(file, FileAction::Failed, 0, Some(err.to_string()));
            }
        }

        if let Err(err) = MirrorStore::ensure_parent(&destination) {
            file.state = VerificationState::Invalid;
            return outcome(file, FileAction::Failed, 0, Some(err.to_string()));
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=max_attempts {
            if attempt > 1 {
                thread::sleep(self.retry.delay_after(attempt - 1));
            }
            match self.attempt(remote, &destination) {
                Ok(()) => {
                    debug!(locator = %remote.locator, attempt, "file verified");
                    file.state = VerificationState::Verified;
                    return outcome(file, FileAction::Fetched, attempt, None);
                }
                Err(err) => {
                    warn!(
                        locator = %remote.locator,
                        attempt,
                        max_attempts,
                        error = %err,
                        "attempt failed"
                    );
                    if let Err(cleanup) = MirrorStore::remove_if_exists(&destination) {
                        warn!(
                            path = %destination,
                            error = %cleanup,
                            "could not remove failed download"
                        );
                    }
                    last_error = Some(err);
                }
            }
        }

        file.state = VerificationState::Invalid;
        let message = last_error
            .map(|err| format!("giving up after {max_attempts} attempt(s): {err}"))
            .unwrap_or_default();
        outcome(file, FileAction::Failed, max_attempts, Some(message))
    }

    /// One fetch followed by the integrity check. An invalid file is deleted.
    fn attempt(&self, remote: &RemoteFile, destination: &Utf8Path) -> Result<(), MirrorError> {
        self.transport.fetch(&remote.locator, destination)?;
        match IntegrityChecker::verify(
            destination,
            remote.expected_size,
            remote.expected_checksum.as_deref(),
        )? {
            Verification::Valid => Ok(()),
            Verification::Invalid(kind) => Err(MirrorError::IntegrityFailure {
                path: destination.as_std_path().to_path_buf(),
                kind,
            }),
        }
    }

    /// `Some` when the file already at `destination` can be kept.
    fn reuse_existing(
        &self,
        destination: &Utf8Path,
        remote: &RemoteFile,
    ) -> Result<Option<VerificationState>, MirrorError> {
        if !destination.as_std_path().exists() {
            return Ok(None);
        }
        if let Some(kind) = IntegrityChecker::check_size(destination, remote.expected_size)? {
            warn!(path = %destination, %kind, "existing output file has wrong size, removing");
            MirrorStore::remove_if_exists(destination)?;
            return Ok(None);
        }
        match self.skip_policy {
            SkipPolicy::Size => {
                debug!(path = %destination, "correct output file exists, skipping");
                Ok(Some(VerificationState::Unknown))
            }
            SkipPolicy::Checksum => match IntegrityChecker::verify(
                destination,
                remote.expected_size,
                remote.expected_checksum.as_deref(),
            )? {
                Verification::Valid => {
                    debug!(path = %destination, "existing output file verified, skipping");
                    Ok(Some(VerificationState::Verified))
                }
                Verification::Invalid(kind) => {
                    warn!(path = %destination, %kind, "existing output file is corrupt, removed");
                    Ok(None)
                }
            },
        }
    }

    /// Full checksum pass over files already in the mirror, without fetching.
    ///
    /// Corrupt files are deleted so the next mirror run fetches them again.
    /// Missing files are reported as `unknown`.
    pub fn verify_all(&self, records: &[MetadataRecord]) -> Result<Vec<MirroredFile>, MirrorError> {
        let files = Self::plan(records)?;
        let mut verified = Vec::with_capacity(files.len());
        for remote in &files {
            if self.cancel.is_cancelled() {
                return Err(MirrorError::Cancelled);
            }
            let destination = self.store.mirror_path(&remote.locator);
            let mut file = MirroredFile::new(destination.as_std_path(), remote);
            let _guard = self.store.lock(&destination);
            if destination.as_std_path().exists() {
                file.state = match IntegrityChecker::verify(
                    &destination,
                    remote.expected_size,
                    remote.expected_checksum.as_deref(),
                )? {
                    Verification::Valid => VerificationState::Verified,
                    Verification::Invalid(kind) => {
                        warn!(path = %destination, %kind, "corrupt mirrored file removed");
                        VerificationState::Invalid
                    }
                };
            }
            verified.push(file);
        }
        Ok(verified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn report_counts() {
        let file = MirroredFile {
            path: "/m/a.fastq.gz".into(),
            expected_size: 1,
            expected_checksum: None,
            state: VerificationState::Unknown,
        };
        let outcome = |action| FileOutcome {
            run_accession: "ERR1".to_string(),
            locator: "h/a.fastq.gz".to_string(),
            file: file.clone(),
            action,
            attempts: 0,
            error: None,
        };
        let mut report = MirrorReport {
            files: vec![outcome(FileAction::Skipped), outcome(FileAction::Fetched)],
            cancelled: false,
        };
        assert!(report.is_complete());
        report.merge(MirrorReport {
            files: vec![outcome(FileAction::Failed)],
            cancelled: false,
        });
        assert_eq!(report.count(FileAction::Failed), 1);
        assert!(!report.is_complete());
    }
}
