//! qvm CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use qvm::config::QvmConfig;
use qvm::diagnostics;
use qvm::paths::VmClass;
use tracing_subscriber::EnvFilter;

mod cli;

/// qvm - QEMU VM session and identity manager
#[derive(Parser, Debug)]
#[command(name = "qvm")]
#[command(about = "QEMU VM session and identity manager")]
#[command(version)]
struct Cli {
    /// VM namespace to operate on.
    #[arg(long, global = true, value_enum, default_value_t = ClassArg::Linux)]
    class: ClassArg,

    /// Output as JSON.
    #[arg(long, global = true)]
    json: bool,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Inspect and manage VM sessions.
    #[command(subcommand)]
    Session(cli::session::SessionCmd),

    /// Manage per-VM unique identifiers.
    #[command(subcommand)]
    Ident(cli::ident::IdentCmd),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ClassArg {
    Linux,
    Macos,
    Windows,
}

impl From<ClassArg> for VmClass {
    fn from(arg: ClassArg) -> Self {
        match arg {
            ClassArg::Linux => VmClass::Linux,
            ClassArg::Macos => VmClass::Macos,
            ClassArg::Windows => VmClass::Windows,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.log_format);

    tracing::debug!(version = qvm::VERSION, "starting qvm");

    // Load configuration
    let config = match QvmConfig::load() {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            QvmConfig::default()
        }
    };

    let ctx = cli::Context {
        config,
        class: cli.class.into(),
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Session(cmd) => cmd.run(&ctx),
        Commands::Ident(cmd) => cmd.run(&ctx),
    };

    if let Err(e) = result {
        let report = diagnostics::classify(&e);
        tracing::error!(code = %report.code, error = %e, "command failed");
        eprintln!("Error: {}", report);
        for suggestion in &report.suggestions {
            eprintln!("  - {}", suggestion);
        }
        if !report.recovery_options.is_empty() {
            eprintln!("To recover:");
            for option in &report.recovery_options {
                eprintln!("  - {}", option);
            }
        }
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("qvm=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
