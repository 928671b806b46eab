use std::path::PathBuf;

use clap::Parser;

use crate::error::{RelayError, Result};

/// Command-line configuration for the relay server.
///
/// `-s`/`--storage-dir` and `-p`/`--port` are the two flags the distilled
/// protocol calls for; the remaining fields make the §5 timing constants
/// configurable instead of hardcoded, in the spirit of `rust-common`'s
/// env/file-overridable `Config`. An unrecognized flag, a missing value, or
/// a malformed port is handled entirely by `clap`: it prints usage to
/// stdout and the process exits non-zero before `Config::parse` returns.
#[derive(Debug, Clone, Parser)]
#[command(name = "tracker-relay", about = "Location-tracking relay server")]
pub struct Config {
    /// Directory holding device marker files and tracking-YYYY-MM-DD logs.
    #[arg(short = 's', long = "storage-dir")]
    pub storage_dir: PathBuf,

    /// TCP and UDP listen port.
    #[arg(short = 'p', long = "port", default_value_t = 80)]
    pub port: u16,

    /// Minimum interval between non-follow-up control requests from the
    /// same remote IP.
    #[arg(long = "rate-limit-interval-secs", default_value_t = 2)]
    pub rate_limit_interval_secs: u64,

    /// How long a link code stays redeemable after being issued.
    #[arg(long = "link-ttl-secs", default_value_t = 60)]
    pub link_ttl_secs: u64,

    /// How long a session may go without receiving bytes before it is
    /// closed as idle.
    #[arg(long = "session-idle-secs", default_value_t = 15)]
    pub session_idle_secs: u64,

    /// Address the Prometheus metrics exporter listens on.
    #[arg(long = "metrics-addr", default_value = "127.0.0.1:9090")]
    pub metrics_addr: String,
}

impl Config {
    /// Parses `std::env::args()` and validates that the storage directory
    /// exists and is a directory.
    pub fn parse_and_validate() -> Result<Self> {
        let config = Config::parse();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.storage_dir.exists() {
            return Err(RelayError::Config(format!(
                "storage directory {} does not exist",
                self.storage_dir.display()
            )));
        }
        if !self.storage_dir.is_dir() {
            return Err(RelayError::Config(format!(
                "{} is not a directory",
                self.storage_dir.display()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_storage_dir() {
        let config = Config {
            storage_dir: PathBuf::from("/definitely/not/a/real/path/for/tests"),
            port: 80,
            rate_limit_interval_secs: 2,
            link_ttl_secs: 60,
            session_idle_secs: 15,
            metrics_addr: "127.0.0.1:9090".to_string(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn accepts_an_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            storage_dir: dir.path().to_path_buf(),
            port: 80,
            rate_limit_interval_secs: 2,
            link_ttl_secs: 60,
            session_idle_secs: 15,
            metrics_addr: "127.0.0.1:9090".to_string(),
        };
        assert!(config.validate().is_ok());
    }
}
