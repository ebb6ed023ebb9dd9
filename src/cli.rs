// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "mozi",
    about = "Multi-agent conversational runtime",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Validate runnable state (config schema, model/agent references,
    /// sandbox health, credentials) and exit without starting anything.
    #[arg(long, global = true)]
    pub doctor: bool,

    /// Base directory holding config.jsonc, secrets.json and session state.
    /// Defaults to $MOZI_HOME, or ~/.config/mozi.
    #[arg(long, global = true, value_name = "DIR")]
    pub home: Option<PathBuf>,

    /// Increase verbosity (-v = debug, -vv = trace).
    #[arg(long, short = 'v', global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Inspect and mutate the on-disk configuration document.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Start the runtime loop, reading NDJSON inbound events from stdin.
    ///
    /// Each line is a JSON object `{"sessionKey": "...", "agentId": "...",
    /// "text": "..."}`. Lifecycle events are written to stdout as NDJSON.
    /// Channel adapters (Telegram, Slack, …) are not implemented here; this
    /// is the minimal harness for exercising the runtime end to end.
    Serve,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommands {
    /// Print the on-disk bytes, their hash, and the parsed/validated config.
    Snapshot {
        /// Emit `{path, rawHash}` as JSON instead of a human-readable report.
        #[arg(long)]
        json: bool,
    },

    /// Set a single field, addressed by dotted path (e.g. `logging.level`).
    Set {
        path: String,
        /// Value to assign, parsed as JSON when possible, otherwise a raw string.
        value: String,
        #[arg(long, value_name = "HASH")]
        expected_hash: Option<String>,
    },

    /// Remove a single field, addressed by dotted path.
    Unset {
        path: String,
        #[arg(long, value_name = "HASH")]
        expected_hash: Option<String>,
    },

    /// Deep-merge a JSON object read from `--file` into the document.
    Patch {
        #[arg(long, short = 'f', value_name = "PATH")]
        file: PathBuf,
        #[arg(long, value_name = "HASH")]
        expected_hash: Option<String>,
    },

    /// Apply a batch of `{set|unset|patch}` operations from a JSON array file.
    /// Aborts the whole batch on the first error; the file stays untouched.
    Apply {
        #[arg(long, short = 'f', value_name = "PATH")]
        file: PathBuf,
        #[arg(long, value_name = "HASH")]
        expected_hash: Option<String>,
    },
}
