//! turbotape CLI - upload files to NodeMCU / ESP8266 boards over serial.
//!
//! ## Features
//!
//! - Chunked upload with SHA1 verification
//! - Automatic retries with exponential backoff
//! - Optional run after upload (`dofile`)
//! - Interactive serial port selection
//! - Environment variable and config file support

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::debug;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use turbotape::{
    ErrorKind, NativePort, SerialConfig, UploadConfig, UploadEvent, UploadReport, UploadSession,
};

mod config;
mod serial;

use config::Config;
use serial::{SerialOptions, select_serial_port};

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// How upload progress is drawn on stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProgressMode {
    /// Nothing.
    Hidden,
    /// One `#` per chunk, for logs and pipes.
    Plain,
    /// Animated indicatif bar.
    Bar,
}

fn progress_mode(quiet: bool, fancy: bool) -> ProgressMode {
    match (quiet, fancy) {
        (true, _) => ProgressMode::Hidden,
        (false, false) => ProgressMode::Plain,
        (false, true) => ProgressMode::Bar,
    }
}

/// Failures that are the user's to fix or that the user caused.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Invalid invocation or environment.
    #[error("{0}")]
    Usage(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Process exit codes.
mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const FAILURE: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const DEVICE_NOT_FOUND: i32 = 4;
    pub const CANCELLED: i32 = 130;
}

/// turbotape - fast, verified file uploads to NodeMCU boards.
///
/// Requires the turbotape receiver to be installed on the device.
///
/// Environment variables:
///   TURBOTAPE_PORT              - Default serial port
///   TURBOTAPE_BAUD              - Default baud rate (default: 115200)
///   TURBOTAPE_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "turbotape")]
#[command(author, version, about, long_about = None)]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// File to upload.
    #[arg(required_unless_present = "list_ports", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, env = "TURBOTAPE_PORT")]
    port: Option<String>,

    /// Baud rate.
    #[arg(short, long, env = "TURBOTAPE_BAUD")]
    baud: Option<u32>,

    /// Run the file with dofile() after a verified upload.
    #[arg(long)]
    run: bool,

    /// Attempts before giving up.
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    max_attempts: Option<u32>,

    /// Pause after each chunk on the first attempt, doubled on every retry.
    #[arg(long, value_name = "MS")]
    initial_delay_ms: Option<u64>,

    /// Response window per command.
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, env = "TURBOTAPE_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", value_name = "PATH")]
    config_path: Option<PathBuf>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long)]
    quiet: bool,

    /// List available serial ports and exit.
    #[arg(long)]
    list_ports: bool,
}

fn main() {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);
    install_interrupt_handler();

    debug!(
        "turbotape v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let code = match run(&cli) {
        Ok(()) => exit_code::SUCCESS,
        Err(err) => report_error(&err),
    };
    std::process::exit(code);
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();
}

/// Route Ctrl-C into the library's interrupt checker.
fn install_interrupt_handler() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || flag.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
        return;
    }
    turbotape::set_interrupt_checker(move || interrupted.load(Ordering::Relaxed));
}

fn run(cli: &Cli) -> Result<()> {
    if cli.list_ports {
        cmd_list_ports();
        return Ok(());
    }

    let file = cli
        .file
        .as_deref()
        .ok_or_else(|| CliError::Usage("no file given".to_string()))?;

    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    };

    cmd_upload(cli, &config, file)
}

/// Combine flags, config and library defaults.
fn upload_config(cli: &Cli, config: &Config) -> UploadConfig {
    let mut upload = UploadConfig::default().with_run(cli.run || config.upload.run);

    if let Some(ms) = cli.initial_delay_ms.or(config.upload.initial_delay_ms) {
        upload = upload.with_initial_delay(Duration::from_millis(ms));
    }
    if let Some(attempts) = cli.max_attempts.or(config.upload.max_attempts) {
        upload = upload.with_max_attempts(attempts);
    }
    if let Some(ms) = cli.timeout_ms.or(config.upload.timeout_ms) {
        upload = upload.with_response_timeout(Duration::from_millis(ms));
    }
    upload
}

fn cmd_upload(cli: &Cli, config: &Config, file: &Path) -> Result<()> {
    if !file.is_file() {
        return Err(anyhow::anyhow!("No such file: {}", file.display()));
    }

    let options = SerialOptions {
        port: cli.port.clone(),
        non_interactive: cli.non_interactive,
    };
    let port_name = select_serial_port(&options, config)?;
    let baud = cli
        .baud
        .or(config.port.baud)
        .unwrap_or(turbotape::port::DEFAULT_BAUD);

    if !cli.quiet {
        eprintln!(
            "{} Using {} at {} baud",
            style("🔌").cyan(),
            style(&port_name).bold(),
            baud
        );
    }

    let port = NativePort::open(&SerialConfig::new(&port_name, baud))
        .with_context(|| format!("Failed to open {port_name}"))?;
    let mut session = UploadSession::from_file(port, file, upload_config(cli, config))?;

    if !cli.quiet {
        eprintln!(
            "{} Uploading {} ({} bytes)",
            style("📦").cyan(),
            session.basename(),
            session.payload().len()
        );
    }

    let mode = progress_mode(cli.quiet, use_fancy_output());
    let pb = if mode != ProgressMode::Bar {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(0);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let quiet = cli.quiet;
    // Plain mode: a row of `#` is still open on stderr
    let mut hashes_open = false;
    let end_hashes = |open: &mut bool| {
        if std::mem::take(open) {
            eprintln!();
        }
    };
    let result = session.upload(|event| match event {
        UploadEvent::AttemptStarted { .. } => pb.reset(),
        UploadEvent::Handshaked { chunks } => {
            pb.set_length(*chunks as u64);
            pb.set_message("sending");
        },
        UploadEvent::ChunkSent { sent, .. } => {
            pb.set_position(*sent as u64);
            if mode == ProgressMode::Plain {
                eprint!("#");
                hashes_open = true;
            }
        },
        UploadEvent::Verifying => {
            end_hashes(&mut hashes_open);
            pb.set_message("verifying");
        },
        UploadEvent::Verified { .. } => pb.finish_with_message("verified"),
        UploadEvent::Running { basename } => {
            if !quiet {
                pb.suspend(|| eprintln!("{} Running {basename}", style("▶").cyan()));
            }
        },
        UploadEvent::Retrying {
            next_delay, error, ..
        } => {
            end_hashes(&mut hashes_open);
            if !quiet {
                pb.suspend(|| {
                    eprintln!("{} {error}", style("✗").yellow());
                    eprintln!(
                        "{} Trying again with delay {} ms",
                        style("↻").yellow(),
                        next_delay.as_millis()
                    );
                });
            }
        },
    });
    end_hashes(&mut hashes_open);

    match result {
        Ok(report) => {
            if !cli.quiet {
                print_success(session.basename(), &report);
            }
            Ok(())
        },
        Err(err) => {
            pb.abandon();
            Err(err.into())
        },
    }
}

fn print_success(basename: &str, report: &UploadReport) {
    eprintln!(
        "\n{} {} uploaded and verified (sha1 {})",
        style("✓").green().bold(),
        basename,
        style(&report.hash).dim()
    );
    if report.attempts > 1 {
        eprintln!(
            "  {} attempts, final delay {} ms",
            report.attempts,
            report.final_delay.as_millis()
        );
    }
}

/// List ports command implementation.
fn cmd_list_ports() {
    let detected = turbotape::discover_ports();

    eprintln!("{}", style("Available serial ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return;
    }

    for line in turbotape::device::format_port_list(&detected) {
        eprintln!("  {} {}", style("•").green(), line);
    }

    if let Ok(auto_port) = turbotape::auto_detect_port() {
        eprintln!(
            "\n{} Auto-detected: {}",
            style("→").green().bold(),
            style(&auto_port.name).cyan().bold()
        );
    }
}

/// Print `err` and map it to an exit code.
fn report_error(err: &anyhow::Error) -> i32 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        eprintln!("{} {cli_err}", style("Error:").red().bold());
        return match cli_err {
            CliError::Usage(_) => exit_code::USAGE,
            CliError::Cancelled(_) => exit_code::CANCELLED,
        };
    }

    eprintln!("{} {err:#}", style("Error:").red().bold());

    let Some(lib_err) = err.downcast_ref::<turbotape::Error>() else {
        return exit_code::FAILURE;
    };

    if let Some((expected, actual)) = lib_err.diagnostic() {
        eprintln!("  {} {expected:?}", style("expected:").dim());
        eprintln!("  {} {actual:?}", style("actual:  ").dim());
    }

    match lib_err {
        turbotape::Error::DeviceNotFound => exit_code::DEVICE_NOT_FOUND,
        turbotape::Error::ReceiverAbsent { .. } => {
            eprintln!(
                "  {}",
                style("Install the turbotape receiver on the device first.").dim()
            );
            exit_code::FAILURE
        },
        _ => exit_code_for(lib_err.kind()),
    }
}

fn exit_code_for(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Usage => exit_code::USAGE,
        ErrorKind::Interrupted => exit_code::CANCELLED,
        ErrorKind::Transmission
        | ErrorKind::Timeout
        | ErrorKind::Mismatch
        | ErrorKind::Integrity
        | ErrorKind::ReceiverAbsent => exit_code::FAILURE,
    }
}
