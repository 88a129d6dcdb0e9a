use std::collections::HashMap;
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};

use crate::domain::MetadataRecord;
use crate::error::MirrorError;

/// Supplies the already parsed read-run table of a study or sample.
///
/// `Ok(None)` means the catalog had nothing for the accession.
pub trait RecordSource: Send + Sync {
    fn records(&self, accession: &str) -> Result<Option<Vec<MetadataRecord>>, MirrorError>;
}

/// Reads `<dir>/<accession>.json`, a JSON array of records.
#[derive(Debug, Clone)]
pub struct JsonRecordSource {
    dir: Utf8PathBuf,
}

impl JsonRecordSource {
    pub fn new(dir: Utf8PathBuf) -> Self {
        Self { dir }
    }

    pub fn path_for(&self, accession: &str) -> Utf8PathBuf {
        self.dir.join(format!("{accession}.json"))
    }
}

impl RecordSource for JsonRecordSource {
    fn records(&self, accession: &str) -> Result<Option<Vec<MetadataRecord>>, MirrorError> {
        let path = self.path_for(accession);
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        load_records(&path).map(Some)
    }
}

impl RecordSource for HashMap<String, Vec<MetadataRecord>> {
    fn records(&self, accession: &str) -> Result<Option<Vec<MetadataRecord>>, MirrorError> {
        Ok(self.get(accession).cloned())
    }
}

pub fn load_records(path: &Utf8Path) -> Result<Vec<MetadataRecord>, MirrorError> {
    let content = fs::read_to_string(path.as_std_path()).map_err(|err| MirrorError::RecordSource {
        path: path.as_std_path().to_path_buf(),
        message: err.to_string(),
    })?;
    serde_json::from_str(&content).map_err(|err| MirrorError::RecordSource {
        path: path.as_std_path().to_path_buf(),
        message: err.to_string(),
    })
}
