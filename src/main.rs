mod cli;
mod config;
mod controller;
mod error;
mod job;
mod shadow;
mod state_machine;

use std::io;
use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

use cli::Cli;
use config::StarterConfig;
use controller::{Starter, build_machine};
use shadow::LocalShadow;
use state_machine::EventHandler;

fn main() -> ExitCode {
    let cli = Cli::parse_args();

    if cli.dot {
        return match build_machine().dot_print(&mut io::stdout().lock()) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("cannot print graph: {e}");
                ExitCode::FAILURE
            }
        };
    }

    init_tracing(cli.verbose);
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("starter failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let mut config = StarterConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.execute {
        config.execute_dir = dir.clone();
    }
    if let Some(dir) = &cli.spool {
        config.spool_dir = dir.clone();
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building the runtime")?;

    runtime.block_on(async {
        let shadow = LocalShadow::new(&config.spool_dir);
        let starter = Starter::new(config, shadow);
        let mut machine = build_machine();
        let mut handler = EventHandler::new(machine.async_events());
        starter.watch_timers(&mut handler);
        handler.install().context("installing signal handlers")?;

        info!(spool = %starter.shadow().spool().display(), "starter running");
        if let Err(e) = machine.execute(&starter, &mut handler).await {
            error!(error = %e, state = %machine.current(), "fatal error, cleaning up");
            starter.exception_cleanup();
            return Err(e).context("state machine aborted");
        }
        handler.de_install()?;
        info!(
            states = machine.history().len(),
            jobs_left = starter.process_count(),
            "starter exiting"
        );
        Ok(())
    })
}
