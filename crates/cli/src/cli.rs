use std::net::SocketAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "autoflow", version, about = "Run, schedule and trigger autoflow execution plans")]
pub struct Cli {
    /// Config file; defaults to AUTOFLOW_CONFIG_PATH or the platform config directory
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Execute a plan once and print the execution with its log
    Run {
        /// Plan file (JSON or YAML)
        #[arg(long)]
        plan: PathBuf,

        /// Plan id when the file holds several plans
        #[arg(long)]
        plan_id: Option<String>,

        /// Trigger input as a JSON document
        #[arg(long, default_value = "{}")]
        input: String,

        /// Run as this user instead of the plan owner
        #[arg(long)]
        user: Option<String>,
    },
    /// Manage encrypted provider credentials
    Credentials {
        #[command(subcommand)]
        action: CredentialAction,
    },
    /// Sync plan triggers, then run the scheduler and webhook listener until Ctrl-C
    Serve {
        /// Directory of plan files
        #[arg(long)]
        plans: PathBuf,

        /// Webhook listener address; overrides the config file
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
    /// List stored scheduled and webhook jobs
    Jobs,
    /// Show recorded runs and aggregate stats for a user
    Runs {
        #[arg(long)]
        user: String,

        /// Only failed runs
        #[arg(long)]
        failed: bool,
    },
    /// Print the next occurrences of a cron expression
    NextRun {
        #[arg(long)]
        cron: String,

        #[arg(long, default_value = "UTC")]
        timezone: String,

        /// Start instant (RFC 3339); defaults to now
        #[arg(long)]
        from: Option<DateTime<Utc>>,

        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Manage the credential master key
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum CredentialAction {
    /// Encrypt and store a credential value
    Set {
        #[arg(long)]
        user: String,

        #[arg(long)]
        provider: String,

        /// Credential kind, e.g. api_key or oauth_token
        #[arg(long, default_value = "api_key")]
        kind: String,

        #[arg(long)]
        value: String,

        /// Expiry instant (RFC 3339)
        #[arg(long)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Mark a credential invalid without deleting it
    Revoke {
        #[arg(long)]
        user: String,

        #[arg(long)]
        provider: String,

        #[arg(long, default_value = "api_key")]
        kind: String,
    },
    /// List usable credential kinds for a provider
    Check {
        #[arg(long)]
        user: String,

        #[arg(long)]
        provider: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum KeyAction {
    /// Generate a new master key
    Generate {
        /// Save it in the OS keychain instead of printing it
        #[arg(long)]
        store: bool,
    },
    /// Delete the master key from the OS keychain
    Remove,
}
