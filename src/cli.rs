// src/cli.rs
use clap::{Parser, Subcommand};

/// Unattended signage display runtime
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Pair this output with the server using a pairing code
    Register {
        /// 6-digit pairing code shown in the dashboard
        #[arg(long = "code", value_name = "CODE")]
        pairing_code: String,

        /// URL-safe display identifier, e.g. lobby-east
        #[arg(long = "slug")]
        slug: String,

        /// Human-readable display name
        #[arg(long = "name")]
        name: String,

        #[arg(long = "width", allow_negative_numbers = true)]
        width: i64,

        #[arg(long = "height", allow_negative_numbers = true)]
        height: i64,

        /// Physical output (defaults to DISPLAY_OUTPUT)
        #[arg(long = "output")]
        output: Option<String>,
    },

    /// Sync the manifest and drive playback until interrupted
    Run {
        /// Registered display to run as (defaults to DISPLAY_SLUG)
        #[arg(long = "slug")]
        slug: Option<String>,
    },

    /// Print this output's fingerprint, key alias and stored registrations
    Identity {
        #[arg(long = "output")]
        output: Option<String>,
    },
}
