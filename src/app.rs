use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use camino::Utf8Path;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::{ResolvedConfig, StudyRequest};
use crate::domain::{MetadataRecord, MirroredFile};
use crate::error::MirrorError;
use crate::filemap::{FileMap, FileMapAggregator, RejectedGrouping};
use crate::links::{LinkOptions, LinkReport, LinkStructureBuilder, require_single_sample};
use crate::mirror::{CancelToken, MirrorEngine, MirrorReport};
use crate::source::RecordSource;
use crate::store::MirrorStore;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingKind {
    Study,
    Sample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingStatus {
    /// Every file mirrored and, where requested, linked.
    Complete,
    /// Some files could not be mirrored.
    Incomplete,
    /// The catalog had no files for this grouping.
    Empty,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupingResult {
    pub accession: String,
    pub kind: GroupingKind,
    pub status: GroupingStatus,
    pub mirror: Option<MirrorReport>,
    pub links: Option<LinkReport>,
    pub error: Option<String>,
}

impl GroupingResult {
    fn new(accession: &str, kind: GroupingKind, status: GroupingStatus) -> Self {
        Self {
            accession: accession.to_string(),
            kind,
            status,
            mirror: None,
            links: None,
            error: None,
        }
    }

    fn failed(accession: &str, kind: GroupingKind, err: &MirrorError) -> Self {
        error!(grouping = accession, error = %err, "grouping failed");
        Self {
            error: Some(err.to_string()),
            ..Self::new(accession, kind, GroupingStatus::Failed)
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FileMapSummary {
    pub path: String,
    pub rows: usize,
    pub empty_groupings: Vec<String>,
    pub rejected: Vec<RejectedGrouping>,
}

impl FileMapSummary {
    fn new(path: &Utf8Path, map: &FileMap) -> Self {
        Self {
            path: path.to_string(),
            rows: map.rows.len(),
            empty_groupings: map.empty_groupings.clone(),
            rejected: map.rejected.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub started_at: String,
    pub finished_at: String,
    pub studies: Vec<GroupingResult>,
    pub samples: Vec<GroupingResult>,
    pub file_map: Option<FileMapSummary>,
    pub cancelled: bool,
}

impl RunResult {
    pub fn has_failures(&self) -> bool {
        self.studies.iter().chain(&self.samples).any(|result| {
            matches!(
                result.status,
                GroupingStatus::Failed | GroupingStatus::Incomplete
            )
        }) || self
            .file_map
            .as_ref()
            .map(|map| !map.rejected.is_empty())
            .unwrap_or(false)
    }
}

/// One mirroring run over the configured studies and samples.
///
/// Studies are mirrored (concurrently when `jobs > 1`) and linked, then the
/// consolidated file map is written once every study has finished. Samples
/// are handled afterwards, one at a time.
pub struct App<T: Transport, S: RecordSource> {
    config: ResolvedConfig,
    engine: MirrorEngine<T>,
    source: S,
}

impl<T: Transport, S: RecordSource> App<T, S> {
    pub fn new(config: ResolvedConfig, transport: T, source: S) -> Self {
        let store = MirrorStore::new(config.mirror_base.clone());
        let engine = MirrorEngine::new(store, transport, config.retry, config.skip_policy);
        Self {
            config,
            engine,
            source,
        }
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.engine = self.engine.with_cancel_token(cancel);
        self
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn engine(&self) -> &MirrorEngine<T> {
        &self.engine
    }

    pub fn run(&self, sink: &dyn ProgressSink) -> Result<RunResult, MirrorError> {
        let started_at = iso_timestamp();
        let start = Instant::now();
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; {} studies, {} samples, transport={}",
                self.config.studies.len(),
                self.config.samples.len(),
                self.engine.transport().name()
            ),
            elapsed: None,
        });
        self.engine.store().ensure_mirror_base()?;

        let processed = self.process_studies(sink);
        let cancelled = self.engine.cancel_token().is_cancelled();

        let file_map = if cancelled {
            warn!("run cancelled, file map not written");
            None
        } else {
            sink.event(ProgressEvent {
                message: "phase=FileMap; aggregating studies".to_string(),
                elapsed: Some(start.elapsed()),
            });
            let map = self.aggregate(
                processed
                    .iter()
                    .map(|(result, records)| (result.accession.as_str(), records.as_deref())),
            );
            map.write(&self.config.file_map_path)?;
            Some(FileMapSummary::new(&self.config.file_map_path, &map))
        };

        let mut samples = Vec::with_capacity(self.config.samples.len());
        for sample in &self.config.samples {
            samples.push(self.process_sample(sample, sink));
        }

        sink.event(ProgressEvent {
            message: "phase=Done".to_string(),
            elapsed: Some(start.elapsed()),
        });
        Ok(RunResult {
            started_at,
            finished_at: iso_timestamp(),
            studies: processed.into_iter().map(|(result, _)| result).collect(),
            samples,
            file_map,
            cancelled: self.engine.cancel_token().is_cancelled(),
        })
    }

    /// Rebuilds the file map from the record source without fetching anything.
    pub fn file_map(&self, sink: &dyn ProgressSink) -> Result<FileMapSummary, MirrorError> {
        sink.event(ProgressEvent {
            message: "phase=FileMap; loading record sets".to_string(),
            elapsed: None,
        });
        let mut loaded = Vec::with_capacity(self.config.studies.len());
        for study in &self.config.studies {
            loaded.push((study.accession.as_str(), self.source.records(&study.accession)?));
        }
        let map = self.aggregate(
            loaded
                .iter()
                .map(|(accession, records)| (*accession, records.as_deref())),
        );
        map.write(&self.config.file_map_path)?;
        Ok(FileMapSummary::new(&self.config.file_map_path, &map))
    }

    pub fn mirror_records(&self, records: &[MetadataRecord]) -> Result<MirrorReport, MirrorError> {
        self.engine.mirror_all(records)
    }

    pub fn verify_records(
        &self,
        records: &[MetadataRecord],
    ) -> Result<Vec<MirroredFile>, MirrorError> {
        self.engine.verify_all(records)
    }

    fn aggregate<'r, I>(&self, groupings: I) -> FileMap
    where
        I: IntoIterator<Item = (&'r str, Option<&'r [MetadataRecord]>)>,
    {
        FileMapAggregator::new(
            self.config.mirror_base.clone(),
            self.config.mirror_root_marker.clone(),
        )
        .aggregate(groupings)
    }

    fn process_studies(
        &self,
        sink: &dyn ProgressSink,
    ) -> Vec<(GroupingResult, Option<Vec<MetadataRecord>>)> {
        let studies = &self.config.studies;
        let jobs = self.config.jobs.min(studies.len()).max(1);
        if jobs == 1 {
            return studies
                .iter()
                .map(|study| self.process_study(study, sink))
                .collect();
        }

        let next = AtomicUsize::new(0);
        let slots = Mutex::new(vec![None; studies.len()]);
        thread::scope(|scope| {
            for _ in 0..jobs {
                scope.spawn(|| {
                    loop {
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        let Some(study) = studies.get(index) else {
                            break;
                        };
                        let processed = self.process_study(study, sink);
                        slots
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())[index] =
                            Some(processed);
                    }
                });
            }
        });
        slots
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .into_iter()
            .flatten()
            .collect()
    }

    /// Mirrors one study and builds its link tree. The record set is handed
    /// back for the file map even when linking failed.
    pub fn process_study(
        &self,
        study: &StudyRequest,
        sink: &dyn ProgressSink,
    ) -> (GroupingResult, Option<Vec<MetadataRecord>>) {
        let accession = study.accession.as_str();
        let kind = GroupingKind::Study;
        if self.engine.cancel_token().is_cancelled() {
            return (
                GroupingResult::new(accession, kind, GroupingStatus::Cancelled),
                None,
            );
        }
        sink.event(ProgressEvent {
            message: format!("phase=Mirror; study {accession}"),
            elapsed: None,
        });

        let records = match self.source.records(accession) {
            Ok(records) => records,
            Err(err) => return (GroupingResult::failed(accession, kind, &err), None),
        };
        let Some(records) = records.filter(|records| records.iter().any(MetadataRecord::has_files))
        else {
            warn!(grouping = accession, "{}", MirrorError::EmptyGrouping(accession.to_string()));
            return (
                GroupingResult::new(accession, kind, GroupingStatus::Empty),
                None,
            );
        };

        let result = self.mirror_and_link(
            accession,
            kind,
            &records,
            study.link_directory.as_deref(),
            LinkOptions {
                sample_manifest: Some(accession.to_string()),
                require_single_sample: false,
            },
            sink,
        );
        (result, Some(records))
    }

    /// Mirrors one sample and links it under `target_base`, if configured.
    pub fn process_sample(&self, sample: &str, sink: &dyn ProgressSink) -> GroupingResult {
        let kind = GroupingKind::Sample;
        if self.engine.cancel_token().is_cancelled() {
            return GroupingResult::new(sample, kind, GroupingStatus::Cancelled);
        }
        sink.event(ProgressEvent {
            message: format!("phase=Mirror; sample {sample}"),
            elapsed: None,
        });

        let records = match self.source.records(sample) {
            Ok(Some(records)) if records.iter().any(MetadataRecord::has_files) => records,
            Ok(_) => {
                warn!(grouping = sample, "{}", MirrorError::EmptyGrouping(sample.to_string()));
                return GroupingResult::new(sample, kind, GroupingStatus::Empty);
            }
            Err(err) => return GroupingResult::failed(sample, kind, &err),
        };
        if let Err(err) = require_single_sample(sample, &records) {
            return GroupingResult::failed(sample, kind, &err);
        }

        self.mirror_and_link(
            sample,
            kind,
            &records,
            self.config.target_base.as_deref(),
            LinkOptions {
                sample_manifest: None,
                require_single_sample: true,
            },
            sink,
        )
    }

    fn mirror_and_link(
        &self,
        accession: &str,
        kind: GroupingKind,
        records: &[MetadataRecord],
        link_directory: Option<&Utf8Path>,
        options: LinkOptions,
        sink: &dyn ProgressSink,
    ) -> GroupingResult {
        let report = match self.engine.mirror_all(records) {
            Ok(report) => report,
            Err(err) => return GroupingResult::failed(accession, kind, &err),
        };
        let status = if report.cancelled {
            GroupingStatus::Cancelled
        } else if report.is_complete() {
            GroupingStatus::Complete
        } else {
            GroupingStatus::Incomplete
        };
        let mut result = GroupingResult {
            mirror: Some(report),
            ..GroupingResult::new(accession, kind, status)
        };
        if status == GroupingStatus::Cancelled {
            return result;
        }

        if let Some(target) = link_directory {
            sink.event(ProgressEvent {
                message: format!("phase=Link; {accession} -> {target}"),
                elapsed: None,
            });
            match LinkStructureBuilder::new(self.engine.store()).build(
                accession, records, target, &options,
            ) {
                Ok(links) => result.links = Some(links),
                Err(err) => {
                    error!(grouping = accession, error = %err, "link tree not built");
                    result.status = GroupingStatus::Failed;
                    result.error = Some(err.to_string());
                }
            }
        }

        info!(grouping = accession, status = ?result.status, "grouping processed");
        result
    }
}

fn iso_timestamp() -> String {
    chrono::Utc::now().to_rfc3339()
}
