use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use camino::Utf8PathBuf;
use reqwest::Url;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::MirrorError;

/// One row of a read-run table as delivered by the catalog collaborator.
///
/// `ftp`, `bytes` and `md5` may pack several `;`-separated values for paired
/// reads; they are positionally aligned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub study_accession: String,
    pub run_accession: String,
    pub sample_accession: String,
    pub experiment_accession: String,
    #[serde(default, deserialize_with = "packed_field")]
    pub ftp: Option<String>,
    #[serde(default, deserialize_with = "packed_field")]
    pub bytes: Option<String>,
    #[serde(default, deserialize_with = "packed_field")]
    pub md5: Option<String>,
    #[serde(default)]
    pub library_layout: String,
    #[serde(default)]
    pub library_strategy: String,
    #[serde(default)]
    pub library_source: String,
    #[serde(default)]
    pub library_selection: String,
}

impl MetadataRecord {
    pub fn has_files(&self) -> bool {
        self.ftp
            .as_deref()
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn library_value(&self, field: LibraryField) -> &str {
        match field {
            LibraryField::Layout => &self.library_layout,
            LibraryField::Strategy => &self.library_strategy,
            LibraryField::Source => &self.library_source,
            LibraryField::Selection => &self.library_selection,
        }
    }

    /// Splits the packed locator columns into one entry per remote file.
    ///
    /// A record without a locator yields nothing. Size and checksum lists must
    /// have exactly as many entries as there are locators.
    pub fn remote_files(&self) -> Result<Vec<RemoteFile>, MirrorError> {
        let Some(ftp) = self.ftp.as_deref().filter(|value| !value.trim().is_empty()) else {
            return Ok(Vec::new());
        };
        let locators = split_packed(ftp);
        let sizes = self.bytes.as_deref().map(split_packed).unwrap_or_default();
        if sizes.len() != locators.len() {
            return Err(self.invalid(format!(
                "{} locator(s) but {} size(s)",
                locators.len(),
                sizes.len()
            )));
        }
        let md5 = self.md5.as_deref().filter(|value| !value.trim().is_empty());
        let checksums: Vec<Option<String>> = match md5 {
            Some(value) => {
                let values = split_packed(value);
                if values.len() != locators.len() {
                    return Err(self.invalid(format!(
                        "{} locator(s) but {} checksum(s)",
                        locators.len(),
                        values.len()
                    )));
                }
                values.into_iter().map(Some).collect()
            }
            None => vec![None; locators.len()],
        };

        locators
            .into_iter()
            .zip(sizes)
            .zip(checksums)
            .map(|((locator, size), checksum)| {
                let expected_size = size
                    .parse::<u64>()
                    .map_err(|_| self.invalid(format!("unparsable size `{size}`")))?;
                Ok(RemoteFile {
                    run_accession: self.run_accession.clone(),
                    locator: locator.parse()?,
                    expected_size,
                    expected_checksum: checksum.map(|value| value.to_ascii_lowercase()),
                })
            })
            .collect()
    }

    fn invalid(&self, message: String) -> MirrorError {
        MirrorError::InvalidRecord {
            run: self.run_accession.clone(),
            message,
        }
    }
}

fn split_packed(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(|part| part.trim().to_string())
        .collect()
}

fn packed_field<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Packed {
        Text(String),
        Number(u64),
    }

    Ok(Option::<Packed>::deserialize(deserializer)?.map(|value| match value {
        Packed::Text(text) => text,
        Packed::Number(number) => number.to_string(),
    }))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryField {
    Layout,
    Strategy,
    Source,
    Selection,
}

impl LibraryField {
    pub const ALL: [LibraryField; 4] = [
        LibraryField::Layout,
        LibraryField::Strategy,
        LibraryField::Source,
        LibraryField::Selection,
    ];

    pub fn column(&self) -> &'static str {
        match self {
            LibraryField::Layout => "library_layout",
            LibraryField::Strategy => "library_strategy",
            LibraryField::Source => "library_source",
            LibraryField::Selection => "library_selection",
        }
    }
}

/// A remote file address: host followed by an absolute path, without scheme.
///
/// Path segments are kept exactly as written in the catalog (no percent
/// encoding), with `.` and `..` resolved so they never climb above the host.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    raw: String,
    host: String,
    segments: Vec<String>,
}

impl Locator {
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The path portion, always starting with `/`.
    pub fn path(&self) -> String {
        format!("/{}", self.segments.join("/"))
    }

    pub fn file_name(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or_default()
    }

    pub fn url(&self, scheme: &str) -> String {
        format!("{scheme}://{}", self.raw)
    }

    /// Path below the mirror root. The host is not part of it.
    pub fn relative_path(&self) -> Utf8PathBuf {
        self.segments.iter().collect()
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

impl FromStr for Locator {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let raw = value.trim();
        if raw.is_empty() || raw.contains("://") {
            return Err(MirrorError::InvalidLocator(value.to_string()));
        }
        let invalid = || MirrorError::InvalidLocator(value.to_string());
        let (host, path) = raw.split_once('/').ok_or_else(invalid)?;
        let valid_host = Url::parse(&format!("http://{host}/"))
            .map(|url| url.host_str().is_some())
            .unwrap_or(false);
        let has_file = path
            .rsplit('/')
            .next()
            .is_some_and(|name| !matches!(name, "" | "." | ".."));
        if !valid_host || !has_file {
            return Err(invalid());
        }

        let mut segments: Vec<String> = Vec::new();
        for segment in path.split('/') {
            match segment {
                "" | "." => {}
                ".." => {
                    segments.pop();
                }
                name => segments.push(name.to_string()),
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            host: host.to_string(),
            segments,
        })
    }
}

/// One file to fetch, with the expectations taken from its metadata record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub run_accession: String,
    pub locator: Locator,
    pub expected_size: u64,
    pub expected_checksum: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationState {
    Unknown,
    Verified,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirroredFile {
    pub path: PathBuf,
    pub expected_size: u64,
    pub expected_checksum: Option<String>,
    pub state: VerificationState,
}

impl MirroredFile {
    pub fn new(path: &Path, remote: &RemoteFile) -> Self {
        Self {
            path: path.to_path_buf(),
            expected_size: remote.expected_size,
            expected_checksum: remote.expected_checksum.clone(),
            state: VerificationState::Unknown,
        }
    }
}
