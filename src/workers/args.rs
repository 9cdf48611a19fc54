//! Command-line argument parsing and configuration.
//!
//! Supports:
//! - CLI arguments via clap
//! - TOML settings file
//! - Merging CLI with file settings (CLI takes precedence)

use anyhow::Result;
use clap::{Parser, Subcommand};
use peerbeam::core::config::Settings;
use std::path::PathBuf;

/// peerbeam - direct peer-to-peer file exchange.
#[derive(Parser, Clone, Debug)]
#[command(author, version, about)]
#[command(propagate_version = true)]
pub struct Args {
    /// Path to the settings file (TOML).
    #[clap(long, default_value = "peerbeam.toml")]
    pub config: PathBuf,

    /// Verbosity level (-v, -vv, -vvv).
    #[clap(short = 'v', long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Gather loopback ICE candidates (both peers on one host).
    #[clap(long, global = true)]
    pub loopback: bool,

    /// Seconds to wait for the connection once ICE gathering completes.
    #[clap(long, global = true)]
    pub connect_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Pair two local peers through an in-process relay and send files
    /// from one to the other over real WebRTC data channels.
    Demo {
        /// Files to send.
        #[clap(required = true)]
        files: Vec<PathBuf>,

        /// Where the receiving peer stores files. Defaults to the
        /// configured download directory.
        #[clap(short, long)]
        output: Option<PathBuf>,
    },
}

impl Args {
    pub fn load() -> Self {
        Args::parse().resolved()
    }

    /// Makes every path absolute against the current directory.
    fn resolved(mut self) -> Self {
        self.config = resolve_path(self.config);
        let Command::Demo { files, output } = &mut self.command;
        *files = files.drain(..).map(resolve_path).collect();
        *output = output.take().map(resolve_path);
        self
    }

    /// Settings from the file, with CLI values on top.
    pub fn settings(&self) -> Result<Settings> {
        let file = Settings::load(&self.config)?;
        Ok(self.merge(file))
    }

    fn merge(&self, mut settings: Settings) -> Settings {
        if self.loopback {
            settings.include_loopback_candidates = true;
        }
        if let Some(secs) = self.connect_timeout {
            settings.connect_timeout_secs = secs;
        }
        if let Command::Demo {
            output: Some(dir), ..
        } = &self.command
        {
            settings.download_dir = dir.clone();
        }
        settings
    }
}

/// Resolve a potentially relative path to an absolute one.
fn resolve_path(p: PathBuf) -> PathBuf {
    if p.is_absolute() {
        p
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    }
}
