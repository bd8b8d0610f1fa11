use anyhow::{Context, Result};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error, warn};
use tracing_subscriber::EnvFilter;

use reel_cache::{
    ChannelObserver, CoordinatorConfig, DiskCacheFile, DownloadCoordinator, DownloadEvent,
    RangeEvent, ReqwestTransport, ResourceLoader,
};

/// Download a media file into a local cache, serving byte ranges while it downloads
#[derive(Debug, Parser)]
#[command(name = "reel-cache", version)]
struct Cli {
    /// Remote resource URL
    url: String,

    /// Local cache file path
    cache_path: PathBuf,

    /// TOML file with coordinator settings
    #[arg(long)]
    config: Option<PathBuf>,

    /// Read one range as `<offset>:<length>` once it is cached
    #[arg(long, value_parser = parse_range)]
    range: Option<(u64, u64)>,

    /// Extra request header as `Name: value`, may be repeated
    #[arg(long = "header", short = 'H')]
    headers: Vec<String>,
}

fn parse_range(value: &str) -> Result<(u64, u64), String> {
    let (offset, length) = value
        .split_once(':')
        .ok_or_else(|| format!("expected <offset>:<length>, got {value:?}"))?;
    let offset = offset.trim().parse().map_err(|e| format!("bad offset: {e}"))?;
    let length = length.trim().parse().map_err(|e| format!("bad length: {e}"))?;
    Ok((offset, length))
}

fn load_config(path: Option<&PathBuf>) -> Result<CoordinatorConfig> {
    let Some(path) = path else {
        return Ok(CoordinatorConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {:?}", path))?;
    let config: CoordinatorConfig =
        toml::from_str(&raw).with_context(|| format!("Failed to parse config file {:?}", path))?;
    Ok(config)
}

/// MIME type from the URL path extension
fn mime_from_extension(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let extension = parsed.path().rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match extension.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        _ => return None,
    };
    Some(mime.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("reel_cache=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    url::Url::parse(&cli.url).with_context(|| format!("Invalid URL {}", cli.url))?;

    let config = load_config(cli.config.as_ref())?;
    CoordinatorConfig::install_default(config.clone())?;

    let transport = ReqwestTransport::new(config.request_timeout())
        .context("Failed to build HTTP client")?;
    let cache_file = DiskCacheFile::open(&cli.cache_path)
        .with_context(|| format!("Failed to open cache file {:?}", cli.cache_path))?;
    let (observer, mut events) = ChannelObserver::new();

    let mut builder =
        DownloadCoordinator::builder(cli.url.clone(), Arc::new(cache_file), Arc::new(transport))
            .observer(observer)
            .mime_lookup(mime_from_extension);
    for header in &cli.headers {
        match header.split_once(':') {
            Some((name, value)) => builder = builder.header(name.trim(), value.trim()),
            None => warn!("Ignoring malformed header {:?}", header),
        }
    }
    let handle = builder.spawn();

    match handle.resolve_metadata().await {
        Ok(metadata) => println!(
            "{}: {} bytes, {}, range requests {}",
            cli.url,
            metadata.content_length,
            metadata.mime_type,
            if metadata.range_supported {
                "supported"
            } else {
                "unsupported"
            }
        ),
        Err(err) => error!("Metadata negotiation failed: {}", err),
    }

    if let Some((offset, length)) = cli.range {
        let mut reader = handle.read_range(offset, length);
        let mut received = 0usize;
        while let Some(event) = reader.next().await {
            match event {
                RangeEvent::Data(chunk) => received += chunk.len(),
                RangeEvent::Finished => {
                    println!("Read {} bytes at offset {}", received, offset);
                }
                RangeEvent::Failed(err) => error!("Range read failed: {}", err),
            }
        }
    }

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, keeping partial cache for resume");
                break Ok(());
            }
            event = events.recv() => match event {
                Some(DownloadEvent::Progress { bytes_so_far, total_expected }) => {
                    if total_expected > 0 {
                        debug!(
                            "Progress: {} / {} bytes ({:.1}%)",
                            bytes_so_far,
                            total_expected,
                            bytes_so_far as f64 * 100.0 / total_expected as f64
                        );
                    }
                }
                Some(DownloadEvent::Completed { path }) => {
                    println!("Cached {} at {:?}", cli.url, path);
                    break Ok(());
                }
                Some(DownloadEvent::Failed { error }) => {
                    break Err(anyhow::anyhow!("Download failed: {}", error));
                }
                None => break Err(anyhow::anyhow!("Coordinator stopped unexpectedly")),
            }
        }
    };

    handle.teardown(false).await.ok();
    outcome
}
