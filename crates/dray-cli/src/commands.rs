use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use dray_sync::{open_remote, DirectoryCatalog, SyncEngine};
use dray_types::{ImageId, ImageRef, RepoTag};
use tracing::debug;

use crate::cli::*;
use crate::config::{process_env, CliConfig};

pub async fn run_command(cli: Cli) -> anyhow::Result<()> {
    let config = CliConfig::load(cli.config.as_deref())?;
    match cli.command {
        Command::Push(args) => cmd_push(&config, args).await,
        Command::Pull(args) => cmd_pull(&config, args).await,
        Command::List(args) => cmd_list(&config, args).await,
        Command::Resolve(args) => cmd_resolve(&config, args).await,
        Command::Validate(args) => cmd_validate(&config, args).await,
    }
}

async fn connect(config: &CliConfig, remote: &str) -> anyhow::Result<SyncEngine> {
    let options = config.store_options(process_env)?;
    debug!(
        remote,
        parallelism = config.sync.parallelism,
        block_size = options.block_size,
        azure_credentials = options.azure.is_some(),
        "connecting"
    );
    let remote = open_remote(remote, &options, config.sync.clone())
        .await
        .with_context(|| format!("opening remote {remote}"))?;
    Ok(SyncEngine::new(Arc::new(remote)))
}

async fn cmd_push(config: &CliConfig, args: PushArgs) -> anyhow::Result<()> {
    let image = ImageRef::parse(&args.image)?;
    let id = args.id.map(ImageId::new).transpose()?;
    let engine = connect(config, &args.remote).await?;

    let report = engine.push(&image, id.as_ref(), &args.workdir).await?;
    println!(
        "{} Pushed {} to {}",
        "✓".green().bold(),
        image.repo_tag().to_string().yellow(),
        engine.remote().describe().bold()
    );
    println!(
        "  {} uploaded ({}), {} unchanged",
        report.uploaded.to_string().green(),
        human_bytes(report.bytes),
        report.skipped
    );
    Ok(())
}

async fn cmd_pull(config: &CliConfig, args: PullArgs) -> anyhow::Result<()> {
    let image = ImageRef::parse(&args.image)?;
    let engine = connect(config, &args.remote).await?;
    let catalog = DirectoryCatalog::new(&args.workdir);

    let report = engine.pull(&image, &args.workdir, &catalog).await?;
    let id = report.id.as_ref().map(ImageId::short).unwrap_or_default();
    if report.images.is_empty() {
        println!("{} {} ({}) is up to date", "✓".green().bold(), args.image.yellow(), id.cyan());
        return Ok(());
    }
    println!("{} Pulled {} ({})", "✓".green().bold(), args.image.yellow(), id.cyan());
    for image_id in &report.images {
        println!("  {} {}", "image".dimmed(), image_id.short().cyan());
    }
    println!(
        "  {} downloaded ({}), {} unchanged",
        report.downloaded.to_string().green(),
        human_bytes(report.bytes),
        report.skipped
    );
    Ok(())
}

async fn cmd_list(config: &CliConfig, args: RemoteArg) -> anyhow::Result<()> {
    let engine = connect(config, &args.remote).await?;
    let tags = engine.remote().list_images().await?;
    if tags.is_empty() {
        println!("No images in {}.", engine.remote().describe().bold());
        return Ok(());
    }
    print!("{}", tag_table(&tags));
    Ok(())
}

async fn cmd_resolve(config: &CliConfig, args: ResolveArgs) -> anyhow::Result<()> {
    let image = ImageRef::parse(&args.image)?;
    let engine = connect(config, &args.remote).await?;
    let (id, _) = engine.resolve(&image).await?;
    println!("{id}");
    Ok(())
}

async fn cmd_validate(config: &CliConfig, args: RemoteArg) -> anyhow::Result<()> {
    let engine = connect(config, &args.remote).await?;
    engine.remote().validate().await?;
    println!("{} {} is reachable", "✓".green().bold(), engine.remote().describe().bold());
    Ok(())
}

/// Two aligned columns, REPOSITORY and TAG, one row per tag.
fn tag_table(tags: &[RepoTag]) -> String {
    let width = tags
        .iter()
        .map(|t| t.repository.len())
        .chain(std::iter::once("REPOSITORY".len()))
        .max()
        .unwrap_or_default();
    let mut out = format!("{:<width$}   TAG\n", "REPOSITORY");
    for t in tags {
        out.push_str(&format!("{:<width$}   {}\n", t.repository, t.tag));
    }
    out
}

fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1000 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64;
    let mut unit = "B";
    for next in UNITS {
        if value < 1000.0 {
            break;
        }
        value /= 1000.0;
        unit = next;
    }
    format!("{value:.1} {unit}")
}
