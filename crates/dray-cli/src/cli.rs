use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "dray",
    about = "Push and pull container image layers to blob storage",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Raise logging to debug
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// TOML settings file
    #[arg(long, global = true, env = "DRAY_CONFIG")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Upload an exported image tree to a remote
    Push(PushArgs),
    /// Download an image and its missing ancestors from a remote
    Pull(PullArgs),
    /// List the repository tags a remote holds
    List(RemoteArg),
    /// Print the full image ID a reference names
    Resolve(ResolveArgs),
    /// Check that a remote is reachable
    Validate(RemoteArg),
}

#[derive(Args)]
pub struct RemoteArg {
    /// s3://bucket[/path], az://container[/path], or a directory
    pub remote: String,
}

#[derive(Args)]
pub struct PushArgs {
    pub remote: String,
    /// Image reference, `repository[:tag]`
    pub image: String,
    /// Publish the tag as pointing at this image ID
    #[arg(long)]
    pub id: Option<String>,
    /// Exported image tree to upload
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,
}

#[derive(Args)]
pub struct PullArgs {
    pub remote: String,
    /// Tag reference or image ID prefix
    pub image: String,
    /// Directory receiving `images/` and the `repositories` index
    #[arg(long, default_value = ".")]
    pub workdir: PathBuf,
}

#[derive(Args)]
pub struct ResolveArgs {
    pub remote: String,
    pub image: String,
}
