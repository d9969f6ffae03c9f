use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub use crate::process::OutputKind;
use crate::process::Platform;

#[derive(Parser)]
#[command(
    name = "downly",
    about = "Downly - download short videos from TikTok, Facebook Reels and YouTube",
    version,
    long_about = "Inspects and downloads videos using yt-dlp and ffmpeg, which are fetched automatically on first use. Run `downly serve` to expose the same pipeline over HTTP."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve {
        /// Address to listen on (overrides the config file)
        #[arg(short, long, value_name = "ADDR")]
        bind: Option<String>,
    },

    /// List the formats and quality tiers available for a URL
    Inspect {
        #[arg(value_name = "URL")]
        url: String,

        /// Platform (inferred from the URL if not specified)
        #[arg(short, long, value_enum)]
        platform: Option<Platform>,

        /// Session cookie for private Facebook content
        #[arg(long, env = "DOWNLY_COOKIE", hide_env_values = true)]
        cookie: Option<String>,
    },

    /// Download one format of a URL
    Download {
        #[arg(value_name = "URL")]
        url: String,

        /// Format id from `inspect`
        #[arg(short, long, value_name = "ID")]
        format: String,

        /// Platform (inferred from the URL if not specified)
        #[arg(short, long, value_enum)]
        platform: Option<Platform>,

        /// Session cookie for private Facebook content
        #[arg(long, env = "DOWNLY_COOKIE", hide_env_values = true)]
        cookie: Option<String>,

        /// Output container
        #[arg(short, long, value_enum, default_value = "mp4")]
        output: OutputKind,

        /// Destination file (defaults to the suggested name in the current directory)
        #[arg(short, long, value_name = "FILE")]
        dest: Option<PathBuf>,
    },

    /// Fetch and validate the extractor and transcoder binaries
    Provision,

    /// Show configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_download_defaults_to_mp4() {
        let cli = Cli::parse_from(["downly", "download", "https://youtu.be/x", "-f", "18"]);
        match cli.command {
            Commands::Download { output, platform, dest, .. } => {
                assert_eq!(output, OutputKind::Mp4);
                assert_eq!(platform, None);
                assert_eq!(dest, None);
            }
            _ => panic!("expected download"),
        }
    }
}
