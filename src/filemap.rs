use std::collections::HashMap;
use std::collections::hash_map::Entry;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::domain::MetadataRecord;
use crate::error::MirrorError;
use crate::naming::{ReadRole, read_role};
use crate::store::MirrorStore;

pub const HEADER: &str = "#study_accession\trun_accession\tsample_accession\t\
    experiment_accession\tfastq_1\tfastq_2\tfastq_single";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMapRow {
    pub study_accession: String,
    pub run_accession: String,
    pub sample_accession: String,
    pub experiment_accession: String,
    pub fastq_1: Option<Utf8PathBuf>,
    pub fastq_2: Option<Utf8PathBuf>,
    pub fastq_single: Option<Utf8PathBuf>,
}

impl FileMapRow {
    fn slot(&mut self, role: ReadRole) -> &mut Option<Utf8PathBuf> {
        match role {
            ReadRole::Forward => &mut self.fastq_1,
            ReadRole::Reverse => &mut self.fastq_2,
            ReadRole::Single => &mut self.fastq_single,
        }
    }

    pub fn to_tsv_line(&self) -> String {
        let path = |value: &Option<Utf8PathBuf>| {
            value
                .as_ref()
                .map(|path| path.to_string())
                .unwrap_or_default()
        };
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}\t{}",
            self.study_accession,
            self.run_accession,
            self.sample_accession,
            self.experiment_accession,
            path(&self.fastq_1),
            path(&self.fastq_2),
            path(&self.fastq_single)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedGrouping {
    pub grouping: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct FileMap {
    pub rows: Vec<FileMapRow>,
    pub empty_groupings: Vec<String>,
    pub rejected: Vec<RejectedGrouping>,
}

impl FileMap {
    pub fn to_tsv(&self) -> String {
        let mut out = String::with_capacity(HEADER.len() + 1 + self.rows.len() * 128);
        out.push_str(HEADER);
        out.push('\n');
        for row in &self.rows {
            out.push_str(&row.to_tsv_line());
            out.push('\n');
        }
        out
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), MirrorError> {
        MirrorStore::write_bytes_atomic(path, self.to_tsv().as_bytes())
    }
}

/// Merges the record sets of many groupings into one run-to-files table.
pub struct FileMapAggregator {
    root: Utf8PathBuf,
    marker: String,
}

impl FileMapAggregator {
    /// `root` is prepended to each locator path from `marker` onwards.
    pub fn new(root: Utf8PathBuf, marker: impl Into<String>) -> Self {
        Self {
            root,
            marker: marker.into(),
        }
    }

    /// Drops the leading components of `locator` up to the mirror root marker.
    pub fn relative_to_root<'l>(&self, locator: &'l str) -> Result<&'l str, MirrorError> {
        let mut rest = locator;
        loop {
            if rest.split('/').next() == Some(self.marker.as_str()) {
                return Ok(rest);
            }
            match rest.split_once('/') {
                Some((_, tail)) => rest = tail,
                None => {
                    return Err(MirrorError::MirrorRootNotFound {
                        path: locator.to_string(),
                        marker: self.marker.clone(),
                    });
                }
            }
        }
    }

    /// One row per (study, run, sample, experiment), in first-seen order.
    pub fn rows_for(&self, records: &[MetadataRecord]) -> Result<Vec<FileMapRow>, MirrorError> {
        let mut rows: Vec<FileMapRow> = Vec::new();
        let mut index: HashMap<(String, String, String, String), usize> = HashMap::new();

        for record in records {
            let files = record.remote_files()?;
            if files.is_empty() {
                continue;
            }
            let key = (
                record.study_accession.clone(),
                record.run_accession.clone(),
                record.sample_accession.clone(),
                record.experiment_accession.clone(),
            );
            let position = match index.entry(key) {
                Entry::Occupied(entry) => *entry.get(),
                Entry::Vacant(entry) => {
                    rows.push(FileMapRow {
                        study_accession: record.study_accession.clone(),
                        run_accession: record.run_accession.clone(),
                        sample_accession: record.sample_accession.clone(),
                        experiment_accession: record.experiment_accession.clone(),
                        fastq_1: None,
                        fastq_2: None,
                        fastq_single: None,
                    });
                    *entry.insert(rows.len() - 1)
                }
            };

            for remote in files {
                let role = read_role(remote.locator.file_name())?;
                let path = self.root.join(self.relative_to_root(remote.locator.as_str())?);
                let slot = rows[position].slot(role);
                if slot.is_some() {
                    warn!(
                        run = %record.run_accession,
                        %role,
                        locator = %remote.locator,
                        "duplicate file for role, keeping the first"
                    );
                    continue;
                }
                *slot = Some(path);
            }
        }
        Ok(rows)
    }

    /// Aggregates every grouping. Groupings without data are logged and
    /// skipped; groupings violating a naming or layout invariant are rejected
    /// as a whole and listed in the result.
    pub fn aggregate<'r, I>(&self, groupings: I) -> FileMap
    where
        I: IntoIterator<Item = (&'r str, Option<&'r [MetadataRecord]>)>,
    {
        let mut map = FileMap::default();
        for (grouping, records) in groupings {
            let records = records.unwrap_or_default();
            if !records.iter().any(MetadataRecord::has_files) {
                let err = MirrorError::EmptyGrouping(grouping.to_string());
                warn!(grouping, "{err}, skipping");
                map.empty_groupings.push(grouping.to_string());
                continue;
            }
            match self.rows_for(records) {
                Ok(rows) => map.rows.extend(rows),
                Err(err) => {
                    error!(grouping, error = %err, "grouping excluded from file map");
                    map.rejected.push(RejectedGrouping {
                        grouping: grouping.to_string(),
                        error: err.to_string(),
                    });
                }
            }
        }
        info!(
            rows = map.rows.len(),
            empty = map.empty_groupings.len(),
            rejected = map.rejected.len(),
            "file map aggregated"
        );
        map
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn relative_to_marker() {
        let aggregator = FileMapAggregator::new(Utf8PathBuf::from("/m"), "vol1");
        assert_eq!(
            aggregator
                .relative_to_root("ftp.sra.ebi.ac.uk/vol1/fastq/ERR1/ERR1.fastq.gz")
                .unwrap(),
            "vol1/fastq/ERR1/ERR1.fastq.gz"
        );
        assert_matches!(
            aggregator.relative_to_root("ftp.sra.ebi.ac.uk/vol2/ERR1.fastq.gz"),
            Err(MirrorError::MirrorRootNotFound { .. })
        );
        assert_matches!(
            aggregator.relative_to_root("host/xvol1/ERR1.fastq.gz"),
            Err(MirrorError::MirrorRootNotFound { .. })
        );
    }

    #[test]
    fn tsv_blank_for_missing_roles() {
        let row = FileMapRow {
            study_accession: "PRJEB1".to_string(),
            run_accession: "ERR1".to_string(),
            sample_accession: "SAMEA1".to_string(),
            experiment_accession: "ERX1".to_string(),
            fastq_1: None,
            fastq_2: None,
            fastq_single: Some(Utf8PathBuf::from("/m/vol1/ERR1.fastq.gz")),
        };
        assert_eq!(
            row.to_tsv_line(),
            "PRJEB1\tERR1\tSAMEA1\tERX1\t\t\t/m/vol1/ERR1.fastq.gz"
        );
        let map = FileMap {
            rows: vec![row],
            ..FileMap::default()
        };
        assert!(map.to_tsv().starts_with(HEADER));
        assert_eq!(map.to_tsv().lines().count(), 2);
    }
}
