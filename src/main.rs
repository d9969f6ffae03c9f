use anyhow::{Context, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use downly::cli::{Cli, Commands};
use downly::config::Config;
use downly::pipeline::{DownloadRequest, InspectRequest, Pipeline};
use downly::provision::{Provisioner, Tool};
use downly::{server, transfer, utils};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.json_logs);

    let mut config = Config::load().await?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            let pipeline = Pipeline::from_config(&config)?;
            server::start_server(&config.server.bind, pipeline).await?;
        }
        Commands::Inspect {
            url,
            platform,
            cookie,
        } => {
            let pipeline = Pipeline::from_config(&config)?;
            let progress = spinner("Inspecting...")?;

            let request = InspectRequest {
                url,
                platform,
                cookie,
            };
            let result = pipeline.inspect(&request).await;
            progress.finish_and_clear();
            let result = result?;

            println!("{}", result.title);
            if let Some(thumbnail) = &result.thumbnail {
                println!("Thumbnail: {}", thumbnail);
            }

            println!("\nQuality tiers:");
            for tier in &result.tiers {
                println!("  {:<6} {}", tier.label, tier.format_id);
            }

            println!("\nFormats:");
            for format in &result.formats {
                println!(
                    "  {:<12} {:<5} {:<10} {}",
                    format.format_id,
                    format.ext.as_deref().unwrap_or("?"),
                    format.resolution.as_deref().unwrap_or("-"),
                    format.filesize.map(utils::format_file_size).unwrap_or_default()
                );
            }
        }
        Commands::Download {
            url,
            format,
            platform,
            cookie,
            output,
            dest,
        } => {
            // nothing else reads the scratch files once they are copied out
            config.transfer.cleanup_grace_secs = 0;
            let pipeline = Pipeline::from_config(&config)?;
            let progress = spinner("Downloading...")?;

            let request = DownloadRequest {
                url,
                format_id: format,
                platform,
                cookie,
                output,
            };
            let payload = match pipeline.download(&request).await {
                Ok(payload) => payload,
                Err(e) => {
                    progress.finish_and_clear();
                    return Err(e.into());
                }
            };

            let dest = dest.unwrap_or_else(|| PathBuf::from(&payload.metadata.filename));
            progress.set_message(format!("Writing {}", dest.display()));

            let written = transfer::write_to(payload.source, &dest).await;
            if let Some(cleanup) = payload.cleanup {
                if let Ok(Err(e)) = cleanup.await {
                    tracing::warn!("Could not remove scratch files: {}", e);
                }
            }
            progress.finish_and_clear();

            let written = written.with_context(|| format!("Failed to write {}", dest.display()))?;
            println!(
                "Saved {} ({})",
                dest.display(),
                utils::format_file_size(written)
            );
        }
        Commands::Provision => {
            let provisioner = Provisioner::from_config(&config)?;

            for tool in [Tool::Extractor, Tool::Transcoder] {
                let progress = spinner(&format!("Provisioning {}...", tool))?;
                let path = provisioner.ensure(tool).await;
                progress.finish_and_clear();

                let path = path.with_context(|| format!("Failed to provision {}", tool))?;
                println!("{}: {}", tool, path.display());
            }
        }
        Commands::Config { show } => {
            if show {
                config.display();
            } else {
                println!("Config file: {}", Config::location()?.display());
                println!("Run `downly config --show` to print the active settings.");
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: bool, json: bool) {
    let default_filter = if verbose { "downly=debug" } else { "downly=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let progress = ProgressBar::new_spinner();
    progress.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .context("Invalid progress template")?,
    );
    progress.set_message(message.to_string());
    progress.enable_steady_tick(Duration::from_millis(100));
    Ok(progress)
}
