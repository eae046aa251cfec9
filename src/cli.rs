use std::path::PathBuf;

use clap::Parser;

use crate::counter::EngineKind;
use crate::logging::LogArgs;

#[derive(Debug, Parser)]
#[command(
    name = "tscnoise",
    about = "Per-CPU histogram of back-to-back time-stamp counter deltas"
)]
pub struct Cli {
    /// Counter-read pairs per CPU (default: 10000000000)
    #[arg(short = 'r', long)]
    pub reps: Option<u64>,

    /// Comma-separated engines to run, in order (default: rdtsc,rdtscp)
    #[arg(short = 'e', long, value_enum, value_delimiter = ',')]
    pub engines: Option<Vec<EngineKind>>,

    /// Omit the per-engine backwards-read comment line
    #[arg(long)]
    pub no_flag_backwards: bool,

    /// Read settings from a TOML file (default: none, compiled-in values)
    #[arg(long = "config")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub log: LogArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_args() {
        let cli = Cli::try_parse_from(["tscnoise"]).unwrap();
        assert!(cli.reps.is_none());
        assert!(cli.engines.is_none());
        assert!(!cli.no_flag_backwards);
        assert!(cli.config_file.is_none());
    }

    #[test]
    fn test_engine_list() {
        let cli =
            Cli::try_parse_from(["tscnoise", "--engines", "rdtscp,rdtsc", "-r", "42"]).unwrap();
        assert_eq!(cli.engines, Some(vec![EngineKind::Rdtscp, EngineKind::Rdtsc]));
        assert_eq!(cli.reps, Some(42));
    }

    #[test]
    fn test_unknown_engine_rejected() {
        assert!(Cli::try_parse_from(["tscnoise", "--engines", "hpet"]).is_err());
    }

    #[test]
    fn test_positional_rejected() {
        assert!(Cli::try_parse_from(["tscnoise", "extra"]).is_err());
    }
}
