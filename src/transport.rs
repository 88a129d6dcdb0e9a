use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use camino::Utf8Path;
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::config::{AsperaSettings, CommandSettings, HttpSettings, TransportConfig};
use crate::domain::Locator;
use crate::error::MirrorError;
use crate::store::MirrorStore;

/// Fetches one remote file to a local path.
///
/// Every failure is reported as [`MirrorError::TransferFailure`] (or a
/// filesystem error); the caller decides whether to retry.
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    fn fetch(&self, locator: &Locator, destination: &Utf8Path) -> Result<(), MirrorError>;
}

/// The configured transport, one of a closed set of protocols.
pub enum TransportDriver {
    Http(HttpTransport),
    Aspera(AsperaTransport),
    Command(CommandTransport),
}

impl TransportDriver {
    pub fn from_config(config: &TransportConfig) -> Result<Self, MirrorError> {
        Ok(match config {
            TransportConfig::Http(settings) => TransportDriver::Http(HttpTransport::new(settings)?),
            TransportConfig::Aspera(settings) => {
                TransportDriver::Aspera(AsperaTransport::new(settings)?)
            }
            TransportConfig::Command(settings) => {
                TransportDriver::Command(CommandTransport::new(settings)?)
            }
        })
    }
}

impl Transport for TransportDriver {
    fn name(&self) -> &'static str {
        match self {
            TransportDriver::Http(inner) => inner.name(),
            TransportDriver::Aspera(inner) => inner.name(),
            TransportDriver::Command(inner) => inner.name(),
        }
    }

    fn fetch(&self, locator: &Locator, destination: &Utf8Path) -> Result<(), MirrorError> {
        match self {
            TransportDriver::Http(inner) => inner.fetch(locator, destination),
            TransportDriver::Aspera(inner) => inner.fetch(locator, destination),
            TransportDriver::Command(inner) => inner.fetch(locator, destination),
        }
    }
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
    scheme: String,
}

impl HttpTransport {
    pub fn new(settings: &HttpSettings) -> Result<Self, MirrorError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("ena-mirror/", env!("CARGO_PKG_VERSION"))),
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()
            .map_err(|err| MirrorError::TransferFailure {
                locator: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self {
            client,
            scheme: settings.scheme.clone(),
        })
    }
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn fetch(&self, locator: &Locator, destination: &Utf8Path) -> Result<(), MirrorError> {
        let failure = |message: String| MirrorError::TransferFailure {
            locator: locator.to_string(),
            message,
        };
        let url = locator.url(&self.scheme);
        debug!(%url, "http request");
        let mut response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| failure(err.to_string()))?;
        if !response.status().is_success() {
            return Err(failure(format!("server returned status {}", response.status())));
        }

        let mut file = File::create(destination.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("create {destination}: {err}")))?;
        std::io::copy(&mut response, &mut file).map_err(|err| failure(err.to_string()))?;
        Ok(())
    }
}

/// Shells out to the Aspera `ascp` client.
///
/// Output goes to a staging directory beside the destination and is renamed
/// into place only after `ascp` exits cleanly, so a partial file never shows up
/// at the destination path.
#[derive(Debug, Clone)]
pub struct AsperaTransport {
    binary: PathBuf,
    key: Option<PathBuf>,
    user: String,
    host: String,
    port: u16,
    bandwidth: String,
}

impl AsperaTransport {
    pub fn new(settings: &AsperaSettings) -> Result<Self, MirrorError> {
        Ok(Self {
            binary: resolve_program(&settings.binary)?,
            key: settings.key.as_ref().map(PathBuf::from),
            user: settings.user.clone(),
            host: settings.host.clone(),
            port: settings.port,
            bandwidth: settings.bandwidth.clone(),
        })
    }

    pub fn source(&self, locator: &Locator) -> String {
        format!("{}@{}:{}", self.user, self.host, locator.path())
    }

    fn args(&self, locator: &Locator, output: &Path) -> Vec<String> {
        let mut args = vec![
            format!("-P{}", self.port),
            "-T".to_string(),
            "-l".to_string(),
            self.bandwidth.clone(),
        ];
        if let Some(key) = &self.key {
            args.push("-i".to_string());
            args.push(key.to_string_lossy().to_string());
        }
        args.push(self.source(locator));
        args.push(output.to_string_lossy().to_string());
        args
    }
}

impl Transport for AsperaTransport {
    fn name(&self) -> &'static str {
        "aspera"
    }

    fn fetch(&self, locator: &Locator, destination: &Utf8Path) -> Result<(), MirrorError> {
        let staging = MirrorStore::staging_dir(destination)?;
        let staged = staging.path().join(locator.file_name());
        run_cmd(locator, &self.binary, &self.args(locator, &staged))?;
        if !staged.exists() {
            return Err(MirrorError::TransferFailure {
                locator: locator.to_string(),
                message: "ascp exited without producing output".to_string(),
            });
        }
        fs::rename(&staged, destination.as_std_path())
            .map_err(|err| MirrorError::Filesystem(format!("move into {destination}: {err}")))?;
        Ok(())
    }
}

/// Any command-line downloader, e.g. `wget` or `curl`.
#[derive(Debug, Clone)]
pub struct CommandTransport {
    program: PathBuf,
    args: Vec<String>,
    scheme: String,
}

impl CommandTransport {
    pub fn new(settings: &CommandSettings) -> Result<Self, MirrorError> {
        Ok(Self {
            program: resolve_program(&settings.program)?,
            args: settings.args.clone(),
            scheme: settings.scheme.clone(),
        })
    }

    fn args(&self, locator: &Locator, output: &Utf8Path) -> Vec<String> {
        let url = locator.url(&self.scheme);
        self.args
            .iter()
            .map(|arg| arg.replace("{url}", &url).replace("{output}", output.as_str()))
            .collect()
    }
}

impl Transport for CommandTransport {
    fn name(&self) -> &'static str {
        "command"
    }

    fn fetch(&self, locator: &Locator, destination: &Utf8Path) -> Result<(), MirrorError> {
        run_cmd(locator, &self.program, &self.args(locator, destination))
    }
}

fn run_cmd(locator: &Locator, program: &Path, args: &[String]) -> Result<(), MirrorError> {
    debug!(program = %program.display(), ?args, "running transfer command");
    let output = Command::new(program)
        .args(args)
        .output()
        .map_err(|err| MirrorError::TransferFailure {
            locator: locator.to_string(),
            message: format!("{}: {err}", program.display()),
        })?;
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let message = if stderr.is_empty() {
        format!("{} exited with {}", program.display(), output.status)
    } else {
        stderr
    };
    Err(MirrorError::TransferFailure {
        locator: locator.to_string(),
        message,
    })
}

fn resolve_program(name: &str) -> Result<PathBuf, MirrorError> {
    let candidate = Path::new(name);
    if candidate.components().count() > 1 {
        return if candidate.exists() {
            Ok(candidate.to_path_buf())
        } else {
            Err(MirrorError::MissingTool(name.to_string()))
        };
    }
    find_in_path(name).ok_or_else(|| MirrorError::MissingTool(name.to_string()))
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
