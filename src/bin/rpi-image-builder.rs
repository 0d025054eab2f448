use std::collections::HashMap;
use std::error::Error as _;
use std::process::ExitCode;

use log::warn;
use rpi_image_builder::config::{usage, HostInfo};
use rpi_image_builder::stages::StageOutcome;
use rpi_image_builder::{
    preflight, BuildConfig, BuildError, BuildResult, CancelFlag, ConfigResolver, Invocation,
    Toolchain,
};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let env: HashMap<String, String> = std::env::vars().collect();

    let resolver = ConfigResolver::new(HostInfo::current());
    let config = match resolver.resolve(&args, &env) {
        Ok(Invocation::Help) => {
            println!("{}", usage());
            return ExitCode::SUCCESS;
        }
        Ok(Invocation::Build(config)) => config,
        Err(e) => {
            init_logging(false);
            return report(&e);
        }
    };
    init_logging(config.verbose);
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    match build(&config) {
        Ok(result) => {
            print_summary(&result);
            ExitCode::SUCCESS
        }
        Err(e) => report(&e),
    }
}

fn build(config: &BuildConfig) -> Result<BuildResult, BuildError> {
    preflight::check_host(config)?;

    let cancel = CancelFlag::new();
    if let Err(e) = cancel.install_signal_handler() {
        warn!("could not install the interrupt handler: {:#}", e);
    }
    let toolchain = Toolchain::system(config)?;
    rpi_image_builder::run(config, toolchain, &cancel)
}

/// `RUST_LOG` wins; otherwise `info`, or `debug` for this crate with
/// `--verbose`.
fn init_logging(verbose: bool) {
    let default = if verbose {
        "info,rpi_image_builder=debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default))
        .format_timestamp(None)
        .init();
}

fn report(err: &BuildError) -> ExitCode {
    eprintln!("Error: {}", err);
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {}", cause);
        source = cause.source();
    }
    if let Some(stage) = err.failed_stage() {
        eprintln!("The build stopped in stage '{}'.", stage);
    }
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}

fn print_summary(result: &BuildResult) {
    println!();
    println!("=== Build complete ===");
    println!("  image:         {}", result.artifact.display());
    println!("  root password: {}", result.credential_file.display());
    println!("  manifest:      {}", result.manifest.display());
    for record in &result.stages {
        if let StageOutcome::Skipped(reason) = &record.outcome {
            println!("  skipped {}: {}", record.name, reason);
        }
    }
    if let Some(workspace) = &result.workspace {
        println!("  workspace kept at {}", workspace.display());
    }
}
