//! CLI argument definitions for the Tandem binary.
//!
//! Priority resolution: CLI args > env vars > config file > defaults.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Tandem: a two-environment transcript pipeline synchronized through a
/// shared, versioned state store.
#[derive(Parser, Debug)]
#[command(name = "tandem", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Environment A: discover new videos and fetch their transcripts.
    Fetch,
    /// Environment B: analyze, publish, build the digest and sweep.
    Process,
    /// Only read the channel feeds and record new videos.
    Discover,
    /// Only run the analysis stage.
    Analyze,
    /// Only upload artifacts for analyzed videos.
    Publish,
    /// Only summarize the current schedule window into a digest.
    Digest,
    /// Only delete working data of finished videos.
    Sweep,
    /// Show pipeline state counts and recent videos.
    Status {
        /// Number of recent videos to list.
        #[arg(short = 'n', long = "limit", default_value_t = 10)]
        limit: usize,
    },
    /// Give an exhausted stage of a video a fresh retry budget.
    Requeue {
        /// Video id.
        id: String,
        /// Stage to reset (transcript, analysis, publish).
        #[arg(short = 's', long = "stage")]
        stage: String,
    },
    /// Analyze an analyzed but unpublished video again.
    Reanalyze {
        /// Video id.
        id: String,
    },
    /// Write a default configuration file.
    InitConfig {
        /// Where to write it; defaults to the resolved config path.
        path: Option<PathBuf>,
        /// Overwrite an existing file.
        #[arg(long = "force")]
        force: bool,
    },
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > TANDEM_CONFIG env var > ~/.tandem/config.toml.
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("TANDEM_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the log filter.
    ///
    /// Priority: --log-level flag > config file value. `RUST_LOG`, when set,
    /// overrides both at subscriber setup.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    if let Ok(home) = std::env::var("USERPROFILE") {
        return PathBuf::from(home).join(".tandem").join("config.toml");
    }
    #[cfg(not(target_os = "windows"))]
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".tandem").join("config.toml");
    }
    PathBuf::from("config.toml")
}
