use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use glob::glob;
use log::info;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (commit ",
    env!("MQSIGHT_BUILD_COMMIT"),
    ", ",
    env!("MQSIGHT_BUILD_DATE"),
    ")"
);

#[derive(Parser, Debug)]
#[command(name = "mqsight")]
#[command(version, long_version = LONG_VERSION)]
#[command(
    about = "Offline analyzer for MQTT/IoT network captures.",
    long_about = None,
    after_help = "Examples:\n  mqsight pcap analyse capture.pcapng -o report.json\n  mqsight pcap analyze capture.pcap --stdout --pretty\n  mqsight pcap analyse capture.pcap -o report.json --root-cause"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Operations on PCAP/PCAPNG inputs (offline-first).
    Pcap {
        #[command(subcommand)]
        command: PcapCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PcapCommands {
    /// Analyse a capture file and generate a versioned JSON report.
    #[command(alias = "analyze")]
    Analyse {
        /// Path to a .pcap or .pcapng file (glob patterns accepted)
        input: PathBuf,

        /// Output report path (JSON)
        #[arg(short = 'o', long, required_unless_present = "stdout")]
        report: Option<PathBuf>,

        /// Write JSON report to stdout
        #[arg(long, conflicts_with = "report")]
        stdout: bool,

        /// Pretty-print JSON output
        #[arg(long, conflicts_with = "compact")]
        pretty: bool,

        /// Compact JSON output (default)
        #[arg(long)]
        compact: bool,

        /// Suppress non-error output
        #[arg(long)]
        quiet: bool,

        /// Print the textual root-cause report after analysis
        #[arg(long)]
        root_cause: bool,

        /// List anomalous messages after analysis
        #[arg(long)]
        list_anomalies: bool,

        /// Exit with a non-zero code if delay anomalies are present
        #[arg(long)]
        strict: bool,
    },
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Pcap { command } => match command {
            PcapCommands::Analyse {
                input,
                report,
                stdout,
                pretty,
                compact,
                quiet,
                root_cause,
                list_anomalies,
                strict,
            } => cmd_pcap_analyse(AnalyseArgs {
                input,
                report,
                stdout,
                pretty,
                compact,
                quiet,
                root_cause,
                list_anomalies,
                strict,
            }),
        },
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {}", err.message);
            if let Some(hint) = err.hint {
                eprintln!("hint: {hint}");
            }
            ExitCode::from(2)
        }
    }
}

#[derive(Debug)]
struct CliError {
    message: String,
    hint: Option<String>,
}

impl CliError {
    fn new(message: impl Into<String>, hint: Option<String>) -> Self {
        Self {
            message: message.into(),
            hint,
        }
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::new(err.to_string(), None)
    }
}

struct AnalyseArgs {
    input: PathBuf,
    report: Option<PathBuf>,
    stdout: bool,
    pretty: bool,
    compact: bool,
    quiet: bool,
    root_cause: bool,
    list_anomalies: bool,
    strict: bool,
}

fn cmd_pcap_analyse(args: AnalyseArgs) -> Result<(), CliError> {
    let input = resolve_input_path(&args.input)?;
    validate_input_file(&input)?;

    info!("analyzing capture {}", input.display());
    let report =
        mqsight_core::analyze_pcap_file(&input).context("PCAP/PCAPNG analysis failed")?;
    let json = serialize_report(&report, args.pretty, args.compact)?;

    if args.stdout {
        print!("{json}");
    } else {
        let target = args.report.as_ref().ok_or_else(|| {
            CliError::new(
                "missing output path",
                Some("use -o/--report or --stdout".to_string()),
            )
        })?;
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {}", parent.display())
                })?;
            }
        }
        fs::write(target, json)
            .with_context(|| format!("Failed to write report: {}", target.display()))?;
        if !args.quiet {
            eprintln!("OK: report written -> {}", target.display());
        }
    }

    if args.root_cause && !args.quiet {
        eprintln!("{}", report.root_cause.render());
    }
    if args.list_anomalies && !args.quiet {
        print_anomalies(&report);
    }
    if args.strict && has_anomalies(&report) {
        return Err(CliError::new(
            "delay anomalies detected",
            Some("use --list-anomalies to inspect".to_string()),
        ));
    }
    Ok(())
}

fn serialize_report(
    report: &mqsight_core::Report,
    pretty: bool,
    compact: bool,
) -> Result<String, CliError> {
    if pretty && compact {
        return Err(CliError::new(
            "cannot use --pretty and --compact together",
            Some("choose one output format".to_string()),
        ));
    }
    if pretty {
        serde_json::to_string_pretty(report)
            .context("JSON serialization failed")
            .map_err(Into::into)
    } else {
        serde_json::to_string(report)
            .context("JSON serialization failed")
            .map_err(Into::into)
    }
}

fn has_anomalies(report: &mqsight_core::Report) -> bool {
    report.delays.messages.iter().any(|m| m.is_anomaly)
}

fn print_anomalies(report: &mqsight_core::Report) {
    let anomalies: Vec<_> = report
        .delays
        .messages
        .iter()
        .filter(|m| m.is_anomaly)
        .collect();
    eprintln!("Anomalous messages: {}", anomalies.len());
    for message in anomalies {
        eprintln!(
            "  {} total={:.4}s bottleneck={}",
            message.msg_id, message.total_delay, message.bottleneck
        );
    }
}

fn validate_input_file(input: &PathBuf) -> Result<(), CliError> {
    if !input.exists() {
        return Err(CliError::new(
            format!("input file not found: {}", input.display()),
            Some("use a .pcap or .pcapng file".to_string()),
        ));
    }
    if !input.is_file() {
        return Err(CliError::new(
            format!("input is not a file: {}", input.display()),
            Some("use a .pcap or .pcapng file".to_string()),
        ));
    }
    let ext = input
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    if ext != "pcap" && ext != "pcapng" {
        return Err(CliError::new(
            format!("unsupported input format '{}'", input.display()),
            Some("expected a .pcap or .pcapng file".to_string()),
        ));
    }
    Ok(())
}

fn resolve_input_path(input: &PathBuf) -> Result<PathBuf, CliError> {
    let pattern = input.to_string_lossy();
    if !is_glob_pattern(&pattern) {
        return Ok(input.clone());
    }

    let paths = glob(&pattern).map_err(|err| {
        CliError::new(
            format!("invalid input pattern '{pattern}'"),
            Some(format!("pattern error: {}", err.msg)),
        )
    })?;
    let mut matches = Vec::new();
    for entry in paths {
        let path = entry.map_err(|err| {
            CliError::new(
                format!("invalid input pattern '{pattern}'"),
                Some(format!("pattern error: {err}")),
            )
        })?;
        if path.is_file() {
            matches.push(path);
        }
    }

    match matches.len() {
        0 => Err(CliError::new(
            format!("no files match pattern '{pattern}'"),
            Some("check the path or quote the pattern; expected .pcap or .pcapng".to_string()),
        )),
        1 => Ok(matches.remove(0)),
        n => Err(CliError::new(
            format!("multiple files match pattern '{pattern}' ({n} matches)"),
            Some("pass a single capture file, or run once per file".to_string()),
        )),
    }
}

fn is_glob_pattern(input: &str) -> bool {
    input.contains('*') || input.contains('?') || input.contains('[')
}
