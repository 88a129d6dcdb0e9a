use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use ena_mirror::app::{App, FileMapSummary, GroupingResult, RunResult};
use ena_mirror::config::{ConfigLoader, ResolvedConfig};
use ena_mirror::domain::{MirroredFile, VerificationState};
use ena_mirror::error::MirrorError;
use ena_mirror::mirror::{CancelToken, FileAction, MirrorReport};
use ena_mirror::naming;
use ena_mirror::output::{JsonOutput, LogSink, OutputMode};
use ena_mirror::source::{JsonRecordSource, load_records};
use ena_mirror::transport::TransportDriver;

const EXIT_INCOMPLETE: u8 = 3;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "ena-mirror")]
#[command(about = "Mirror ENA read files, verify them and build browsable link trees")]
#[command(version, author)]
struct Cli {
    /// Config file (default: ena-mirror.json in the current directory)
    #[arg(long, global = true)]
    config: Option<String>,

    /// Print results as JSON on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Mirror and link every configured study and sample, then write the file map")]
    Run,
    #[command(about = "Mirror one record set (JSON array of records)")]
    Mirror { records: Utf8PathBuf },
    #[command(about = "Re-check checksums of already mirrored files of a record set")]
    Verify { records: Utf8PathBuf },
    #[command(about = "Rebuild the consolidated file map without fetching")]
    Filemap,
    #[command(about = "Print the normalized local name of read files")]
    Normalize { names: Vec<String> },
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(err) = report.downcast_ref::<MirrorError>() {
                return ExitCode::from(map_exit_code(err));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &MirrorError) -> u8 {
    match error {
        MirrorError::MissingConfig | MirrorError::ConfigRead(_) | MirrorError::ConfigParse(_) => 2,
        MirrorError::TransferFailure { .. } | MirrorError::MissingTool(_) => EXIT_INCOMPLETE,
        MirrorError::Cancelled => EXIT_CANCELLED,
        _ => 1,
    }
}

fn run() -> miette::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    if let Commands::Normalize { names } = &cli.command {
        for name in names {
            println!("{}", naming::normalize(name)?);
        }
        return Ok(ExitCode::SUCCESS);
    }

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let cancel = install_cancel_handler()?;
    let app = build_app(config)?.with_cancel_token(cancel);

    match cli.command {
        Commands::Run => {
            let result = match output_mode {
                OutputMode::Json => app.run(&JsonOutput)?,
                OutputMode::Human => app.run(&LogSink)?,
            };
            match output_mode {
                OutputMode::Json => JsonOutput::print_run(&result).into_diagnostic()?,
                OutputMode::Human => print_run_summary(&result),
            }
            Ok(run_exit_code(&result))
        }
        Commands::Mirror { records } => {
            let records = load_records(&records)?;
            let report = app.mirror_records(&records)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_mirror(&report).into_diagnostic()?,
                OutputMode::Human => print_mirror_summary("records", &report),
            }
            Ok(if report.cancelled {
                ExitCode::from(EXIT_CANCELLED)
            } else if report.is_complete() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_INCOMPLETE)
            })
        }
        Commands::Verify { records } => {
            let records = load_records(&records)?;
            let files = app.verify_records(&records)?;
            match output_mode {
                OutputMode::Json => JsonOutput::print_verify(&files).into_diagnostic()?,
                OutputMode::Human => print_verify_summary(&files),
            }
            let all_valid = files
                .iter()
                .all(|file| file.state == VerificationState::Verified);
            Ok(if all_valid {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_INCOMPLETE)
            })
        }
        Commands::Filemap => {
            let summary = match output_mode {
                OutputMode::Json => app.file_map(&JsonOutput)?,
                OutputMode::Human => app.file_map(&LogSink)?,
            };
            match output_mode {
                OutputMode::Json => JsonOutput::print_file_map(&summary).into_diagnostic()?,
                OutputMode::Human => print_file_map_summary(&summary),
            }
            Ok(if summary.rejected.is_empty() {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(1)
            })
        }
        Commands::Normalize { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn build_app(config: ResolvedConfig) -> miette::Result<App<TransportDriver, JsonRecordSource>> {
    let transport = TransportDriver::from_config(&config.transport)?;
    let source = JsonRecordSource::new(config.records_dir.clone());
    Ok(App::new(config, transport, source))
}

/// First Ctrl-C stops after the file in flight, the second one exits.
fn install_cancel_handler() -> miette::Result<CancelToken> {
    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        if handler_token.is_cancelled() {
            eprintln!("\nInterrupted again, exiting.");
            std::process::exit(EXIT_CANCELLED as i32);
        }
        eprintln!("\nInterrupted, finishing the current file (Ctrl-C again to abort)...");
        handler_token.cancel();
    })
    .into_diagnostic()?;
    Ok(cancel)
}

fn run_exit_code(result: &RunResult) -> ExitCode {
    if result.cancelled {
        ExitCode::from(EXIT_CANCELLED)
    } else if result.has_failures() {
        ExitCode::from(EXIT_INCOMPLETE)
    } else {
        ExitCode::SUCCESS
    }
}

fn print_run_summary(result: &RunResult) {
    println!("ena-mirror summary");
    for grouping in result.studies.iter().chain(&result.samples) {
        print_grouping(grouping);
    }
    match &result.file_map {
        Some(summary) => print_file_map_summary(summary),
        None => println!("file map: not written"),
    }
    if result.cancelled {
        println!("run was cancelled");
    }
}

fn print_grouping(grouping: &GroupingResult) {
    println!(
        "{:?} {} ({:?})",
        grouping.kind, grouping.accession, grouping.status
    );
    if let Some(report) = &grouping.mirror {
        print_mirror_summary("  files", report);
    }
    if let Some(links) = &grouping.links {
        println!(
            "  links: {} for {} sample(s), {} missing",
            links.links.len(),
            links.samples.len(),
            links.missing.len()
        );
    }
    if let Some(error) = &grouping.error {
        println!("  error: {error}");
    }
}

fn print_mirror_summary(label: &str, report: &MirrorReport) {
    println!(
        "{label}: {} fetched, {} already present, {} failed",
        report.count(FileAction::Fetched),
        report.count(FileAction::Skipped),
        report.count(FileAction::Failed)
    );
    for failure in report.failures() {
        println!(
            "    failed {}: {}",
            failure.locator,
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn print_verify_summary(files: &[MirroredFile]) {
    let count = |state| files.iter().filter(|file| file.state == state).count();
    println!(
        "verified: {}, invalid (removed): {}, missing: {}",
        count(VerificationState::Verified),
        count(VerificationState::Invalid),
        count(VerificationState::Unknown)
    );
}

fn print_file_map_summary(summary: &FileMapSummary) {
    println!("file map: {} ({} rows)", summary.path, summary.rows);
    for grouping in &summary.empty_groupings {
        println!("  no data for {grouping}");
    }
    for rejected in &summary.rejected {
        println!("  excluded {}: {}", rejected.grouping, rejected.error);
    }
}
