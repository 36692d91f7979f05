//! # Main — CLI Entry Point
//!
//! Parses the legacy `-nue <k> -f <hostfile> <restart_exec> <exec...> <grid_x>
//! <grid_y>` grammar, layers it with the optional `depman.toml` overlay,
//! installs the SIGINT handler, and runs the supervisor to completion.

use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use depman::config::{self, Config};
use depman::error::DepmanError;
use depman::supervisor::{request_halt, Supervisor};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

extern "C" fn handle_sigint(_signum: libc::c_int) {
    request_halt();
}

fn install_sigint_handler() {
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as libc::sighandler_t);
    }
}

/// Writes INFO/DEBUG/WARN/ERROR to both `infoli.log` and stderr. Returns the
/// non-blocking writer's guard, which must stay alive for the file sink to
/// flush — `main` holds it for the process's lifetime.
fn init_logging(dev_mode: bool) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::never(".", "infoli.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if dev_mode { "debug" } else { "info" }));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false),
        )
        .init();

    guard
}

fn exit_code_for(error: &DepmanError) -> u8 {
    error.exit_code().unwrap_or(1) as u8
}

fn main() -> ExitCode {
    let argv: Vec<String> = std::env::args().skip(1).collect();

    let cli_args = match config::parse_cli(&argv) {
        Ok(args) => args,
        Err(e) => {
            eprintln!("depman: {e}");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    let _log_guard = init_logging(cli_args.dev_mode);

    if let Err(e) = config::check_environment(cli_args.dev_mode) {
        tracing::error!(error = %e, "environment check failed");
        return ExitCode::from(exit_code_for(&e));
    }

    let config = match Config::build(cli_args) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to build configuration");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    let supervisor = match Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize the supervisor");
            return ExitCode::from(exit_code_for(&e));
        }
    };

    install_sigint_handler();

    match run(supervisor) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "supervisor exited with an error");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

fn run(supervisor: Arc<Supervisor>) -> Result<(), DepmanError> {
    supervisor.start()
}
