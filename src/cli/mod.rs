//! CLI argument parsing using clap 4.x derive macros

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Human-in-the-loop approvals and input for tool-using agents
///
/// Run `seeker serve` next to the agent and `seeker watch` wherever a person
/// answers its questions. Any number of observers may watch; the first
/// answer wins.
#[derive(Parser, Debug)]
#[command(name = "seeker")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(disable_version_flag = true)]
pub struct Cli {
    /// The command to execute
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Read configuration from this file instead of the search path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Print version information
    #[arg(long)]
    pub version: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the observer server and the expiry sweeper
    Serve {
        /// Address to listen on (overrides `server.bind`)
        #[arg(short, long)]
        bind: Option<String>,

        /// Drive a scripted agent that asks for approvals and input
        #[arg(long)]
        demo: bool,
    },

    /// Watch a server and answer its requests in this terminal
    Watch {
        /// Server URL (overrides `client.url`)
        #[arg(short, long)]
        url: Option<String>,

        /// Nudge the agent forward when it goes quiet
        #[arg(short, long)]
        auto_continue: bool,

        /// Start with auto-continue paused
        #[arg(long, requires = "auto_continue")]
        paused: bool,
    },

    /// Print the resolved configuration
    Config {
        /// Only print where the configuration is read from
        #[arg(long)]
        path: bool,
    },
}
