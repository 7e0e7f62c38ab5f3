mod cli;

use clap::Parser;
use cli::{Cli, Commands, GetArgs, UploadArgs};
use fetchengine::config::Config;
use fetchengine::observability::init_tracing;
use fetchengine::{
    FetchBody, FetchDelegate, FetchError, FetchRequest, FetchResponse, FetchService,
    ReqwestTransport, RetryPolicy, UploadSource,
};
use reqwest::header::{HeaderName, HeaderValue};
use std::io::Write;
use tracing::{debug, info};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let config = match cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    init_tracing(&config.telemetry);

    match cli.command {
        Commands::Get(args) => get(&config, args).await?,
        Commands::Upload(args) => upload(&config, args).await?,
    }

    Ok(())
}

/// `--retry` turns retry on with the configured intervals.
fn service(config: &Config, force_retry: bool) -> Result<FetchService<ReqwestTransport>, BoxError> {
    let service = FetchService::from_config(config)?;
    if !force_retry {
        return Ok(service);
    }
    let policy = RetryPolicy {
        enabled: true,
        ..config.retry.policy()
    };
    Ok(service.with_retry(policy))
}

async fn get(config: &Config, args: GetArgs) -> Result<(), BoxError> {
    let service = service(config, args.retry)?;
    let mut request = FetchRequest::get(args.url);
    for (name, value) in args.headers {
        request = request.with_header(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(&value)?,
        );
    }

    let mut fetcher = service.fetcher(request);
    if let Some(ref path) = args.output {
        fetcher = fetcher.with_download_path(path);
    }

    let response = fetcher.fetch().await?;
    info!(status = response.status.as_u16(), url = %response.url, "Fetched");

    match response.body {
        FetchBody::Bytes(bytes) => std::io::stdout().write_all(&bytes)?,
        FetchBody::File { path, len } => {
            info!(path = %path.display(), bytes = len, "Saved response body");
        }
    }
    Ok(())
}

/// Logs upload progress as it climbs.
struct ProgressLog;

impl FetchDelegate for ProgressLog {
    fn fetch_finished(&mut self, _response: FetchResponse) {}

    fn fetch_failed(&mut self, _error: FetchError) {}

    fn sent_data(&mut self, _bytes_sent: u64, total_bytes_sent: u64, expected: Option<u64>) {
        debug!(sent = total_bytes_sent, expected, "Upload progress");
    }
}

async fn upload(config: &Config, args: UploadArgs) -> Result<(), BoxError> {
    let mut service = service(config, args.retry)?;
    if let Some(chunk_size) = args.chunk_size {
        service = service.with_chunk_size(chunk_size);
    }

    let upload = service.upload_fetcher(
        FetchRequest::post(args.url),
        UploadSource::File(args.file),
        args.mime,
    );

    let response = upload.fetch_with(&mut ProgressLog).await?;
    info!(status = response.status.as_u16(), url = %response.url, "Upload complete");

    if let Some(bytes) = response.body.bytes() {
        std::io::stdout().write_all(bytes)?;
    }
    Ok(())
}
