pub mod cli;
pub mod error;
pub mod tftp;

use std::net::SocketAddrV4;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use tokio_util::sync::CancellationToken;

use cli::CliOptions;
use error::FatalError;
use tftp::dispatcher::Dispatcher;
use tftp::io_traits::{FsFileSource, StdUdpEndpoint};

fn main() -> ExitCode {
    let options = CliOptions::parse();
    cli::init_logger(options.debug);

    if let Err(e) = options.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    match run(options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(options: CliOptions) -> Result<(), FatalError> {
    let listen_addr = SocketAddrV4::new(options.bind, options.port);
    let endpoint = StdUdpEndpoint::bind(listen_addr).map_err(FatalError::SocketBind)?;
    info!("listening on {listen_addr}, serving {}", options.root_dir.display());

    let cancel_token = CancellationToken::new();
    let sigint_token = cancel_token.clone();
    ctrlc::set_handler(move || {
        info!("received SIGINT");
        sigint_token.cancel();
    })
    .map_err(|e| FatalError::InvalidArgs(format!("failed to install SIGINT handler: {e}")))?;

    let mut dispatcher = Dispatcher::new(endpoint, FsFileSource, options.root_dir);
    dispatcher.run(&cancel_token)?;
    info!("shutting down");
    Ok(())
}
