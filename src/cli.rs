//! CLI argument parsing via clap.

use clap::{Parser, Subcommand, ValueEnum};

/// Terminal client for the constitutions server: chat against a configured
/// assistant and manage constitutions.
#[derive(Debug, Parser)]
#[command(name = "creeds", version = creeds::build_info::CLI_VERSION)]
pub struct Args {
    /// Path to config file (default: ./creeds.toml or ~/.config/creeds/creeds.toml).
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<String>,

    /// Override server base URL.
    #[arg(long = "base-url", global = true)]
    pub base_url: Option<String>,

    /// Disable color output.
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Log debug output to stderr (RUST_LOG takes precedence).
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Write a default creeds.toml to the given path (default: ./creeds.toml).
    Init {
        #[arg(default_value = "creeds.toml")]
        path: String,
    },
    /// Send one message and stream the reply.
    Chat {
        prompt: String,
        /// Continue an existing thread instead of starting a new one.
        #[arg(short = 't', long = "thread")]
        thread: Option<String>,
        /// Session to file a new thread under (default: the active one).
        #[arg(short = 's', long = "session")]
        session: Option<String>,
        /// Run against the server's ephemeral test thread.
        #[arg(long = "test")]
        test: bool,
        /// Constitution module to apply; repeatable.
        #[arg(short = 'm', long = "module")]
        modules: Vec<String>,
        /// Adherence level applied to every module.
        #[arg(long = "adherence", value_parser = clap::value_parser!(u8).range(1..=5))]
        adherence: Option<u8>,
    },
    /// Print a thread's latest transcript.
    History { thread: String },
    /// Manage local sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Browse, check, and submit constitutions.
    Constitutions {
        #[command(subcommand)]
        action: ConstitutionsAction,
    },
    /// List trending marketplace constitutions.
    Marketplace {
        #[arg(short = 'n', long = "limit", default_value_t = 10)]
        limit: u32,
    },
    /// Admin review queue.
    Reviews {
        #[command(subcommand)]
        action: ReviewsAction,
    },
}

#[derive(Debug, Subcommand)]
pub enum SessionsAction {
    /// List sessions and their threads.
    List,
    /// Create a session and make it active.
    New {
        /// Display name for the session.
        #[arg(long = "name")]
        name: Option<String>,
    },
    /// Make a session active.
    Use { id: String },
}

#[derive(Debug, Subcommand)]
pub enum ConstitutionsAction {
    /// List available constitutions.
    List,
    /// Print a constitution's text.
    Show { path: String },
    /// Run the superego check on a local file.
    Check { file: String },
    /// Submit a local file for hosting.
    Submit {
        file: String,
        #[arg(long = "title")]
        title: Option<String>,
        #[arg(long = "description")]
        description: Option<String>,
        #[arg(long = "email")]
        email: Option<String>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        /// Keep the constitution private (no review, no marketplace).
        #[arg(long = "private", conflicts_with = "unlisted")]
        private: bool,
        /// Reachable by link only.
        #[arg(long = "unlisted")]
        unlisted: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum ReviewsAction {
    /// List pending submissions.
    List,
    /// Approve or reject a submission.
    Decide {
        id: String,
        #[arg(value_enum)]
        decision: Decision,
        #[arg(long = "comment")]
        comment: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Decision {
    Approve,
    Reject,
}
