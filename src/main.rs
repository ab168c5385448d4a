//! pijs-env - run JavaScript files in disposable test environments

#![forbid(unsafe_code)]

use std::io;
use std::path::Path;
use std::rc::Rc;

use anyhow::{Context as _, Result};
use clap::Parser;
use pijs_env::cli::Cli;
use pijs_env::{EnvironmentConfig, Error, Host, HostOptions, TestEnvironment};
use tracing_subscriber::EnvFilter;

fn main() {
    match main_impl() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("Error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Returns whether every file ran cleanly.
fn main_impl() -> Result<bool> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let config = cli.environment_config()?;
    let host = Host::new(HostOptions::default())?;

    let mut failures = 0_usize;
    for file in &cli.files {
        match run_file(&host, &config, file, cli.run_all_timers) {
            Ok(()) => println!("PASS {}", file.display()),
            Err(err) => {
                failures += 1;
                println!("FAIL {}", file.display());
                print_failure(&err);
            }
        }
    }

    if cli.files.len() > 1 {
        println!(
            "\n{} passed, {} failed",
            cli.files.len() - failures,
            failures
        );
    }
    Ok(failures == 0)
}

fn run_file(
    host: &Rc<Host>,
    config: &EnvironmentConfig,
    path: &Path,
    run_all_timers: bool,
) -> Result<()> {
    let source = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let file_name = path.display().to_string();

    let mut env = TestEnvironment::new(Rc::clone(host), config.clone())?;
    env.run_source_text(&source, &file_name)?;
    env.run_microtasks()?;
    host.run_immediates()?;
    if run_all_timers {
        env.run_all_timers()?;
        env.run_microtasks()?;
    }

    for reported in env.reported_errors()? {
        eprintln!("  warning: {reported}");
    }
    env.dispose();
    Ok(())
}

fn print_failure(err: &anyhow::Error) {
    match err.downcast_ref::<Error>() {
        Some(Error::Evaluation {
            stack: Some(stack),
            message,
            ..
        }) => {
            eprintln!("  {message}");
            for line in stack.lines() {
                eprintln!("  {line}");
            }
        }
        _ => eprintln!("  {err:#}"),
    }
}
