//! Command-line interface for coravoice
//!
//! Provides argument parsing using clap derive macros.

use crate::session::{Mood, Scenario};
use crate::voice::catalog::{Gender, Quality};
use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

/// Practice customer-service conversations by voice
#[derive(Parser, Debug)]
#[command(
    name = "coravoice",
    version,
    about = "Practice customer-service conversations by voice"
)]
pub struct Cli {
    /// Subcommand to execute (default: chat)
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Only show warnings and errors in the log
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Verbose logging (-v: debug, -vv: trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start an interactive conversation with Cora
    Chat(ChatArgs),

    /// List the speaker's voices and what each preference would pick
    Voices {
        /// Only show voices of this gender
        #[arg(long, value_name = "GENDER", value_parser = parse_gender)]
        gender: Option<Gender>,

        /// Quality class to rank by (premium, enhanced, standard)
        #[arg(long, value_name = "QUALITY")]
        quality: Option<Quality>,
    },

    /// View and modify configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Args, Debug, Default, Clone, PartialEq)]
pub struct ChatArgs {
    /// Customer mood (neutral, happy, curious, frustrated, confused, impatient)
    #[arg(long, short = 'm', value_name = "MOOD")]
    pub mood: Option<Mood>,

    /// Let Cora open with a scenario (product, complaint, return, technical)
    #[arg(long, short = 's', value_name = "SCENARIO")]
    pub scenario: Option<Scenario>,

    /// Turn voice mode on from the start
    #[arg(long)]
    pub voice: bool,

    /// Do not speak Cora's replies
    #[arg(long)]
    pub mute: bool,

    /// Make the console speaker fail with this voice (repeatable), to try out retries
    #[arg(long = "broken-voice", value_name = "NAME")]
    pub broken_voices: Vec<String>,
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Get a configuration value by key (e.g., voice.locale)
    Get {
        /// Dotted key path (e.g., voice.preference, timing.quiet_period_ms)
        key: String,
    },
    /// Set a configuration value by key
    Set {
        /// Dotted key path (e.g., voice.preference, timing.quiet_period_ms)
        key: String,
        /// Value to set
        value: String,
    },
    /// List current configuration values
    List,
    /// Print the built-in defaults as TOML
    Dump,
    /// Print the configuration file path
    Path,
}

fn parse_gender(s: &str) -> Result<Gender, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "male" => Ok(Gender::Male),
        "female" => Ok(Gender::Female),
        other => Err(format!("unknown gender '{}' (expected male or female)", other)),
    }
}
