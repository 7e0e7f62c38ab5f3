use clap::{Parser, Subcommand};
use fetchengine::units::ByteSize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "fetchengine")]
#[command(about = "Fetch and upload over HTTP with retry, redirects and caching", long_about = None)]
pub struct Cli {
    /// Configuration file (overrides FETCHENGINE_CONFIG)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch a URL and print or save the body
    Get(GetArgs),
    /// Upload a file through a resumable upload session
    Upload(UploadArgs),
}

#[derive(clap::Args, Debug)]
pub struct GetArgs {
    pub url: String,

    /// Write the body to this file instead of stdout
    #[arg(long, short)]
    pub output: Option<PathBuf>,

    /// Retry transient failures with backoff
    #[arg(long)]
    pub retry: bool,

    /// Extra request header, `Name: value`
    #[arg(long = "header", short = 'H', value_parser = parse_header)]
    pub headers: Vec<(String, String)>,
}

#[derive(clap::Args, Debug)]
pub struct UploadArgs {
    /// URL that creates the upload session
    pub url: String,

    pub file: PathBuf,

    #[arg(long, default_value = "application/octet-stream")]
    pub mime: mime::Mime,

    /// Chunk size such as `256KB` or `5MB` (defaults to the configured size)
    #[arg(long)]
    pub chunk_size: Option<ByteSize>,

    /// Retry transient failures with backoff
    #[arg(long)]
    pub retry: bool,
}

fn parse_header(raw: &str) -> Result<(String, String), String> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("expected `Name: value`, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("empty header name in {raw:?}"));
    }
    Ok((name.to_string(), value.trim().to_string()))
}
