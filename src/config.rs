use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::error::MirrorError;

pub const DEFAULT_CONFIG_FILE: &str = "ena-mirror.json";

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    pub mirror_base: String,
    #[serde(default)]
    pub target_base: Option<String>,
    #[serde(default)]
    pub records_dir: Option<String>,
    #[serde(default)]
    pub file_map: Option<String>,
    #[serde(default)]
    pub mirror_root_marker: Option<String>,
    #[serde(default)]
    pub studies: Vec<StudyEntry>,
    #[serde(default)]
    pub samples: Vec<String>,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub skip_policy: SkipPolicy,
    #[serde(default)]
    pub jobs: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StudyEntry {
    Shorthand(String),
    Detailed(StudyEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StudyEntryObject {
    pub accession: String,
    #[serde(default)]
    pub directory: Option<String>,
}

/// Which protocol fetches the files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum TransportConfig {
    Http(HttpSettings),
    Aspera(AsperaSettings),
    Command(CommandSettings),
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Http(HttpSettings::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HttpSettings {
    #[serde(default = "default_scheme")]
    pub scheme: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AsperaSettings {
    #[serde(default = "default_ascp")]
    pub binary: String,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_aspera_user")]
    pub user: String,
    #[serde(default = "default_aspera_host")]
    pub host: String,
    #[serde(default = "default_aspera_port")]
    pub port: u16,
    #[serde(default = "default_aspera_bandwidth")]
    pub bandwidth: String,
}

impl Default for AsperaSettings {
    fn default() -> Self {
        Self {
            binary: default_ascp(),
            key: None,
            user: default_aspera_user(),
            host: default_aspera_host(),
            port: default_aspera_port(),
            bandwidth: default_aspera_bandwidth(),
        }
    }
}

/// Generic downloader invocation. `{url}` and `{output}` in `args` are
/// substituted per file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CommandSettings {
    #[serde(default = "default_command_program")]
    pub program: String,
    #[serde(default = "default_command_args")]
    pub args: Vec<String>,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            program: default_command_program(),
            args: default_command_args(),
            scheme: default_scheme(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl RetryPolicy {
    /// Linear backoff before the attempt following `attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.delay_ms.saturating_mul(attempt as u64))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

/// How an already present destination file is judged on later runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SkipPolicy {
    /// Byte size only; keeps repeated runs cheap.
    #[default]
    Size,
    /// Byte size and full checksum.
    Checksum,
}

#[derive(Debug, Clone)]
pub struct StudyRequest {
    pub accession: String,
    /// Link tree root, `None` when the study is only mirrored.
    pub link_directory: Option<Utf8PathBuf>,
}

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub mirror_base: Utf8PathBuf,
    pub target_base: Option<Utf8PathBuf>,
    pub records_dir: Utf8PathBuf,
    pub file_map_path: Utf8PathBuf,
    pub mirror_root_marker: String,
    pub studies: Vec<StudyRequest>,
    pub samples: Vec<String>,
    pub transport: TransportConfig,
    pub retry: RetryPolicy,
    pub skip_policy: SkipPolicy,
    pub jobs: usize,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, MirrorError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(MirrorError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| MirrorError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| MirrorError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, MirrorError> {
        let schema_version = config.schema_version.unwrap_or(SCHEMA_VERSION);
        if schema_version != SCHEMA_VERSION {
            return Err(MirrorError::ConfigParse(format!(
                "unsupported schema_version {schema_version}, expected {SCHEMA_VERSION}"
            )));
        }

        if config.mirror_base.trim().is_empty() {
            return Err(MirrorError::ConfigParse(
                "mirror_base must not be empty".to_string(),
            ));
        }
        let mirror_base = Utf8PathBuf::from(config.mirror_base.trim());

        let jobs = config.jobs.unwrap_or(1);
        if jobs == 0 {
            return Err(MirrorError::ConfigParse(
                "jobs must be at least 1".to_string(),
            ));
        }
        if config.retry.max_attempts == 0 {
            return Err(MirrorError::ConfigParse(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }

        let studies = config
            .studies
            .into_iter()
            .map(|entry| match entry {
                StudyEntry::Shorthand(accession) => StudyRequest {
                    accession: accession.trim().to_string(),
                    link_directory: None,
                },
                StudyEntry::Detailed(obj) => StudyRequest {
                    accession: obj.accession.trim().to_string(),
                    link_directory: obj
                        .directory
                        .filter(|dir| dir.trim() != "*" && !dir.trim().is_empty())
                        .map(|dir| Utf8PathBuf::from(dir.trim())),
                },
            })
            .collect::<Vec<_>>();

        let transport = match config.transport {
            TransportConfig::Aspera(mut settings) => {
                if settings.key.is_none() {
                    settings.key = default_aspera_key();
                }
                TransportConfig::Aspera(settings)
            }
            other => other,
        };

        let file_map_path = mirror_base.join(
            config
                .file_map
                .unwrap_or_else(|| "filemap.tsv".to_string()),
        );

        Ok(ResolvedConfig {
            target_base: config.target_base.map(Utf8PathBuf::from),
            records_dir: Utf8PathBuf::from(
                config.records_dir.unwrap_or_else(|| "records".to_string()),
            ),
            file_map_path,
            mirror_root_marker: config
                .mirror_root_marker
                .unwrap_or_else(|| "vol1".to_string()),
            studies,
            samples: config
                .samples
                .into_iter()
                .map(|sample| sample.trim().to_string())
                .filter(|sample| !sample.is_empty())
                .collect(),
            transport,
            retry: config.retry,
            skip_policy: config.skip_policy,
            jobs,
            mirror_base,
        })
    }
}

fn default_aspera_key() -> Option<String> {
    BaseDirs::new().map(|dirs| {
        dirs.home_dir()
            .join(".aspera")
            .join("connect")
            .join("etc")
            .join("asperaweb_id_dsa.openssh")
            .to_string_lossy()
            .into_owned()
    })
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_ascp() -> String {
    "ascp".to_string()
}

fn default_aspera_user() -> String {
    "era-fasp".to_string()
}

fn default_aspera_host() -> String {
    "fasp.sra.ebi.ac.uk".to_string()
}

fn default_aspera_port() -> u16 {
    33001
}

fn default_aspera_bandwidth() -> String {
    "300m".to_string()
}

fn default_command_program() -> String {
    "wget".to_string()
}

fn default_command_args() -> Vec<String> {
    vec![
        "-q".to_string(),
        "-O".to_string(),
        "{output}".to_string(),
        "{url}".to_string(),
    ]
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1000
}
