//! tailf — show the last lines of up to five files and follow them.
//!
//! Usage:
//!     tailf [-N | -n N] FILE...
//!     tailf -h | --help
//!     tailf -v | --version

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tailf::cli::{self, Config, Invocation};
use tailf::{trap_signals, Follower, Options, StdoutSink};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let config = match cli::parse(std::env::args_os()) {
        Ok(Invocation::Follow(config)) => config,
        Ok(Invocation::Help(help)) => {
            print!("{}", help);
            return ExitCode::SUCCESS;
        }
        Ok(Invocation::Version(version)) => {
            println!("{}", version);
            return ExitCode::SUCCESS;
        }
        Err(tailf::Error::Usage(e)) => {
            let _ = e.print();
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    match follow(config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn follow(config: Config) -> anyhow::Result<ExitCode> {
    let shutdown = CancellationToken::new();
    trap_signals(shutdown.clone()).context("error while registering signal trap")?;

    let options = Options {
        lines: config.lines,
        ..Options::default()
    };
    let sink = Arc::new(StdoutSink::new(config.labelled()));
    let mut follower = Follower::new(options, sink)?;

    debug!(files = config.files.len(), "files to tail");
    for file in &config.files {
        follower.add_file(file).await?;
    }

    let outcomes = follower.run(shutdown).await;
    let failed = outcomes.iter().filter(|outcome| outcome.result.is_err()).count();
    debug!(failed, "all files done");

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TAILF_LOG")
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}
