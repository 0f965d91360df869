//! Entry point: parses the CLI, sets up logging and error reporting, and
//! hands off to the supervisor. Mirrors the teacher's `main.rs` split
//! between `setup()` (color_eyre + tracing) and the actual run, adapted to
//! also route logs to a file when `--log-file` is given
//! (`original_source/cbus/logging_config.py`).

mod cli;
mod codec;
mod confirmation;
mod labels;
mod mqtt;
mod pci;
mod supervisor;
mod throttler;
mod topics;

use std::fs::File;
use std::process::ExitCode;

use clap::Parser;
use cli::Cli;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup(&cli) {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::FAILURE;
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(supervisor::run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(report) => {
            eprintln!("{report:?}");
            ExitCode::FAILURE
        }
    }
}

fn setup(cli: &Cli) -> color_eyre::Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::try_new(tracing_filter_directive(&cli.verbosity))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    match &cli.log_file {
        Some(path) => {
            let file = File::create(path)?;
            subscriber
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => subscriber.init(),
    }

    Ok(())
}

/// Maps the CLI's argparse-flavoured verbosity names
/// (`CRITICAL`/`ERROR`/`WARNING`/`INFO`/`DEBUG`) onto `tracing` directives,
/// accepting `tracing`'s own names too so `CMQTTD_VERBOSITY=warn` also works.
fn tracing_filter_directive(verbosity: &str) -> String {
    match verbosity.to_ascii_uppercase().as_str() {
        "CRITICAL" | "ERROR" => "error".to_string(),
        "WARNING" | "WARN" => "warn".to_string(),
        "INFO" => "info".to_string(),
        "DEBUG" => "debug".to_string(),
        "TRACE" => "trace".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_argparse_style_names() {
        assert_eq!(tracing_filter_directive("WARNING"), "warn");
        assert_eq!(tracing_filter_directive("CRITICAL"), "error");
        assert_eq!(tracing_filter_directive("DEBUG"), "debug");
    }
}
