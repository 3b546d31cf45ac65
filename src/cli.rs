//! Command-line interface definitions.

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "wptsync", about = "Mirror gecko wpt changes into upstream web-platform-tests")]
pub struct Cli {
    /// Log subprocess invocations and sync decisions
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Pull changes from the remote hosts and advance syncs
    Update,

    /// Run the upstreaming pass against a revision
    Upstream {
        /// Revision to upstream to; defaults to the integration branch head
        rev: Option<String>,
        /// Override the base of the processed range (first-run bootstrap)
        #[arg(long)]
        base_rev: Option<String>,
    },

    /// Re-evaluate a single PR
    Pr {
        /// PR number; defaults to the sync owning the current directory's branch
        pr_id: Option<u64>,
    },

    /// Re-evaluate all syncs for a bug
    Bug {
        /// Bug number; defaults to the sync owning the current directory's branch
        bug: Option<u64>,
    },

    /// List in-progress syncs
    List {
        /// Restrict to the given sync types
        sync_type: Vec<String>,
        /// Only syncs with a recorded error
        #[arg(long)]
        error: bool,
    },

    /// Show full detail for a bug's syncs
    Detail {
        sync_type: String,
        /// Bug number
        obj_id: u64,
    },

    /// Force a status transition (operator escape hatch)
    Status {
        /// Object type; only "sync" is handled here
        obj_type: String,
        sync_type: String,
        /// Bug number
        obj_id: u64,
        new_status: String,
        /// Only move syncs currently in this status ("*" for any)
        #[arg(long, default_value = "*")]
        old_status: String,
        /// Only move the sync with this sequence number
        #[arg(long)]
        seq_id: Option<u32>,
    },

    /// Delete a sync by bug number
    Delete {
        sync_type: String,
        /// Bug number
        obj_id: u64,
        /// Delete only the sync's try pushes
        #[arg(long = "try")]
        try_pushes: bool,
    },

    /// Fetch from a configured repository
    Fetch {
        #[arg(value_parser = ["gecko", "web-platform-tests"])]
        repo: String,
    },
}
