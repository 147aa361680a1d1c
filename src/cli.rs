//! Quorum CLI
//!
//! Commands:
//! - `quorum migrate` - Apply database migrations
//! - `quorum analyst --profile <p>` - Run one analyst
//! - `quorum manager` / `trader` / `risk` - Run one role
//! - `quorum run-all` - Every role in one process

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::agents::Profile;

/// Multi-agent portfolio coordination
#[derive(Parser, Debug)]
#[command(name = "quorum")]
#[command(author, version, about = "Multi-agent portfolio coordination", long_about = None)]
pub struct Cli {
    /// Directory holding default.toml and per-environment overrides
    #[arg(long, env = "QUORUM_CONFIG_DIR", default_value = "config")]
    pub config_dir: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Apply pending database migrations
    Migrate,

    /// Run one analyst
    Analyst {
        /// value | quality | growth | deep-value | macro
        #[arg(short, long)]
        profile: Profile,
    },

    /// Run the manager (aggregation, weighting, outcome resolution)
    Manager,

    /// Run the trader
    Trader,

    /// Run the risk monitor
    Risk,

    /// Run every agent in one process
    RunAll,
}

impl Commands {
    /// Whether the command hosts agents that must share a bus with other processes
    pub fn is_single_role(&self) -> bool {
        matches!(
            self,
            Commands::Analyst { .. } | Commands::Manager | Commands::Trader | Commands::Risk
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_analyst_profile() {
        let cli = Cli::try_parse_from(["quorum", "analyst", "--profile", "deep-value"]).unwrap();
        match cli.command {
            Commands::Analyst { profile } => assert_eq!(profile, Profile::DeepValue),
            other => panic!("unexpected command {:?}", other),
        }
        assert_eq!(cli.config_dir, PathBuf::from("config"));
    }

    #[test]
    fn test_parse_rejects_unknown_profile() {
        assert!(Cli::try_parse_from(["quorum", "analyst", "--profile", "momentum"]).is_err());
    }

    #[test]
    fn test_run_all_is_not_single_role() {
        let cli = Cli::try_parse_from(["quorum", "--config-dir", "/etc/quorum", "run-all"]).unwrap();
        assert!(!cli.command.is_single_role());
        assert_eq!(cli.config_dir, PathBuf::from("/etc/quorum"));
        assert!(Commands::Risk.is_single_role());
    }
}
