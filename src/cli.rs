use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use simple_logger::SimpleLogger;

use crate::error::FatalError;
use crate::tftp::consts::TFTP_LISTEN_PORT;

/// A single-socket, read-only TFTP server.
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct CliOptions {
    #[arg(help = "UDP port to listen on")]
    pub port: u16,

    #[arg(help = "Directory served to clients; filenames are resolved relative to it")]
    pub root_dir: PathBuf,

    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED, help = "Interface address to bind")]
    pub bind: Ipv4Addr,

    #[arg(value_enum, short, long, default_value_t = DebugLevel::Warn, help = "Debug level to determine which messages are printed")]
    pub debug: DebugLevel,
}

impl CliOptions {
    /// Post-parse validation `clap` can't express declaratively: port `0`
    /// is never valid, and the root directory must already exist.
    pub fn validate(&self) -> Result<(), FatalError> {
        if self.port == 0 {
            return Err(FatalError::InvalidArgs(format!(
                "port must be in 1..=65535 (default TFTP port is {TFTP_LISTEN_PORT})"
            )));
        }

        match self.root_dir.try_exists() {
            Ok(true) => Ok(()),
            _ => Err(FatalError::InvalidRoot(self.root_dir.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum, Default)]
pub enum DebugLevel {
    Off,
    Error,

    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<DebugLevel> for log::LevelFilter {
    fn from(value: DebugLevel) -> Self {
        match value {
            DebugLevel::Off => Self::Off,
            DebugLevel::Error => Self::Error,
            DebugLevel::Warn => Self::Warn,
            DebugLevel::Info => Self::Info,
            DebugLevel::Debug => Self::Debug,
            DebugLevel::Trace => Self::Trace,
        }
    }
}

pub fn init_logger(debug_level: DebugLevel) {
    SimpleLogger::new().with_level(debug_level.into()).env().init().unwrap();
}
