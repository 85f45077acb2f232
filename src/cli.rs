//! Pacer command-line interface built on clap.
//!
//! [`Cli`] carries the global overrides; [`Command`] picks what to run
//! (upload, probe, demo).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::config::PacerConfig;

/// Pacer: adaptive, resource-bounded upload coordinator.
#[derive(Debug, Parser)]
#[command(name = "pacer", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a TOML config file (defaults to ./pacer.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Retries per file before it is marked failed.
    #[arg(long, global = true)]
    pub max_retries: Option<u32>,

    /// Files per issuer round trip (at most 50).
    #[arg(long, global = true)]
    pub batch_size: Option<usize>,

    /// Concurrent transfer workers.
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// More log output (-v info, -vv debug, -vvv trace).
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Upload files, skipping those already stored.
    Upload {
        /// Files to upload.
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Identify files by a content hash so renamed copies are detected.
        #[arg(long, default_value_t = false)]
        fingerprint: bool,
    },

    /// Print host readings, pressure and slot ceilings as JSON.
    Probe,

    /// Run the coordinator against an in-memory issuer and store.
    Demo {
        /// Number of files to simulate.
        #[arg(long, default_value_t = 12)]
        files: usize,

        /// How many of them the store already has.
        #[arg(long, default_value_t = 3)]
        duplicates: usize,

        /// How many fail once before succeeding.
        #[arg(long, default_value_t = 2)]
        flaky: usize,
    },
}

impl Cli {
    /// Fold the command-line overrides into `config`.
    pub fn apply_overrides(&self, config: &mut PacerConfig) {
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if let Some(batch) = self.batch_size {
            config.batch_size = batch;
        }
        if let Some(workers) = self.workers {
            config.workers = Some(workers);
        }
    }
}
