mod dispatch;
mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;

use clap::Parser;
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{error, info};

use uiharness_ipc::transport::{EndpointRole, UnixDatagramTransport};
use uiharness_ipc::{socket_dir, TransactionServer};

#[derive(Debug, Parser)]
#[command(name = "uiharness-daemon", about = "Resident uiharness transaction daemon")]
struct Args {
    /// Pairing token shared with the harness process.
    #[arg(long)]
    token: String,

    /// Rendezvous socket directory; defaults to UIHARNESS_SOCKET_DIR or the
    /// system temp dir.
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set.
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let _telemetry = telemetry::init_tracing(&args.log_level);

    let dir = args.socket_dir.unwrap_or_else(socket_dir);
    let transport = match UnixDatagramTransport::with_socket_dir(
        &args.token,
        EndpointRole::Server,
        &dir,
    ) {
        Ok(transport) => transport,
        Err(err) => {
            error!(error = %err, "failed to build transport");
            return ExitCode::FAILURE;
        }
    };

    let server = Arc::new(TransactionServer::new(transport));
    server.set_call_function(dispatch::builtin_dispatcher);
    if let Err(err) = server.initialize() {
        error!(error = %err, "failed to initialize transaction server");
        return ExitCode::FAILURE;
    }
    info!(token = %args.token, socket_dir = %dir.display(), pid = std::process::id(), "daemon started");

    match Signals::new([SIGINT, SIGTERM]) {
        Ok(mut signals) => {
            let transceiver = Arc::clone(server.transceiver());
            let spawned = thread::Builder::new()
                .name("signal-handler".to_string())
                .spawn(move || {
                    if let Some(signal) = signals.forever().next() {
                        info!(signal, "received signal, shutting down");
                        transceiver.finalize();
                    }
                });
            if let Err(err) = spawned {
                error!(error = %err, "failed to spawn signal handler");
                return ExitCode::FAILURE;
            }
        }
        Err(err) => {
            error!(error = %err, "failed to install signal handlers");
            return ExitCode::FAILURE;
        }
    }

    let exit_code = server.run_loop();
    server.finalize();
    info!(exit_code, "daemon stopped");
    ExitCode::from(exit_code as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_cli_parses_token_and_socket_dir() {
        let args =
            Args::parse_from(["uiharness-daemon", "--token", "abc", "--socket-dir", "/run/ui"]);
        assert_eq!(args.token, "abc");
        assert_eq!(args.socket_dir, Some(PathBuf::from("/run/ui")));
        assert_eq!(args.log_level, "info");
    }
}
