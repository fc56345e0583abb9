#![cfg(feature = "cli")]
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};
use kdam::{tqdm, Bar, BarExt};
use rsa::traits::PublicKeyParts;
use tracing::{info, warn, Level};

use rsmusicdl::config::PipelineConfig;
use rsmusicdl::device::{CredentialStore, DeviceCredential};
use rsmusicdl::fetch::{Fetcher, HttpFetcher, DEFAULT_ORIGIN};
use rsmusicdl::hls::MediaManifest;
use rsmusicdl::key::ContentKey;
use rsmusicdl::mux::{FfmpegMuxer, FileMuxer, Muxer};
use rsmusicdl::pipeline::{KeySource, Pipeline, ResolvedStream, SegmentProgress};
use rsmusicdl::protection::{self, Protection};
use rsmusicdl::utils::safe_filename;

#[derive(Parser)]
#[command(name = "rsmusicdl", version, disable_version_flag = true, about = "rsmusicdl CLI")]
struct Cli {
    #[arg(short = 'v', long = "version", action = ArgAction::SetTrue)]
    version: bool,

    #[arg(short = 'd', long = "debug", action = ArgAction::SetTrue)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

/// CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Download and decrypt the audio stream behind an HLS media playlist.
    Download {
        url: String,
        #[arg(short = 'o', long = "output")]
        output: Option<PathBuf>,
        /// Device (.wvd) used for license requests.
        #[arg(short = 'c', long = "cdm")]
        cdm: Option<PathBuf>,
        /// Content key in hex; skips the license server.
        #[arg(short = 'k', long = "key")]
        key: Option<String>,
        #[arg(long = "config")]
        config: Option<PathBuf>,
        /// Remux through ffmpeg instead of writing the fMP4 as is.
        #[arg(long = "ffmpeg", action = ArgAction::SetTrue)]
        ffmpeg: bool,
    },
    /// Acquire and print the content keys of a stream.
    License {
        url: String,
        #[arg(short = 'c', long = "cdm")]
        cdm: Option<PathBuf>,
        #[arg(long = "config")]
        config: Option<PathBuf>,
    },
    /// Inspect protection data: base64 PSSH, a PSSH box, an MP4 or a playlist.
    Pssh { input: String },
    /// Show the contents of a WVD device file.
    Device { wvd_path: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .init();

    info!("rsmusicdl version {}", env!("CARGO_PKG_VERSION"));

    if cli.version {
        return Ok(());
    }

    match cli.command {
        Some(Commands::Download {
            url,
            output,
            cdm,
            key,
            config,
            ffmpeg,
        }) => run_download(
            &url,
            output.as_deref(),
            cdm.as_deref(),
            key.as_deref(),
            config.as_deref(),
            ffmpeg,
        ),
        Some(Commands::License { url, cdm, config }) => {
            run_license(&url, cdm.as_deref(), config.as_deref())
        }
        Some(Commands::Pssh { input }) => run_pssh(&input),
        Some(Commands::Device { wvd_path }) => run_device(&wvd_path),
        None => Ok(()),
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<PipelineConfig> {
    match path {
        Some(path) => PipelineConfig::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => Ok(PipelineConfig::default()),
    }
}

fn load_credential(cdm: Option<&Path>, config: &PipelineConfig) -> anyhow::Result<DeviceCredential> {
    let path = cdm
        .map(Path::to_path_buf)
        .or_else(|| config.device_path.clone())
        .or_else(CredentialStore::discover)
        .context("No device found; pass --cdm or set RSMUSICDL_CDM")?;
    let credential = DeviceCredential::from_path(&path)
        .with_context(|| format!("Failed to load device {}", path.display()))?;
    info!(
        "[+] Loaded Device ({} L{})",
        credential.system_id, credential.security_level
    );
    Ok(credential)
}

fn http_fetcher(config: &PipelineConfig) -> anyhow::Result<HttpFetcher> {
    let origin = config.origin.as_deref().unwrap_or(DEFAULT_ORIGIN);
    Ok(HttpFetcher::new(
        Duration::from_secs(config.license_timeout_secs),
        Some(origin),
        config.user_agent.as_deref(),
    )?)
}

/// `<playlist stem>.m4a` in the current directory.
fn default_output(url: &str) -> PathBuf {
    let stem = url
        .split(['?', '#'])
        .next()
        .and_then(|path| path.rsplit('/').next())
        .and_then(|name| name.rsplit_once('.').map(|(stem, _)| stem).or(Some(name)))
        .filter(|stem| !stem.is_empty())
        .unwrap_or("output");
    PathBuf::from(format!("{}.m4a", safe_filename(stem)))
}

fn run_download(
    url: &str,
    output: Option<&Path>,
    cdm: Option<&Path>,
    key: Option<&str>,
    config_path: Option<&Path>,
    ffmpeg: bool,
) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let fetcher = http_fetcher(&config)?;
    let output = output.map_or_else(|| default_output(url), Path::to_path_buf);

    let key_source = match key {
        Some(hex) => KeySource::manual(ContentKey::from_hex(hex)?, &config),
        None => KeySource::license(load_credential(cdm, &config)?, &config)?,
    };

    let muxer: Box<dyn Muxer> = if ffmpeg {
        Box::new(FfmpegMuxer::spawn(&output)?)
    } else {
        Box::new(FileMuxer::create(&output)?)
    };

    let mut pipeline = Pipeline::new(config, fetcher, muxer)
        .with_key_source(key_source)
        .with_progress(segment_bar());

    let token = pipeline.cancel_token();
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            std::process::exit(130);
        }
        warn!("Interrupted; stopping before the next segment (press again to abort)");
        token.cancel();
    })?;

    let summary = pipeline
        .run(url)
        .with_context(|| format!("Download failed in state {}", pipeline.state()))?;

    info!(
        "[+] {} segment(s), {} sample(s) decrypted, {} bytes written",
        summary.segments, summary.samples_decrypted, summary.bytes_written
    );
    if !summary.encrypted {
        info!("Stream was not encrypted");
    }
    info!("[+] Saved to: {}", output.display());
    Ok(())
}

/// A per-segment progress bar, created once the segment count is known.
fn segment_bar() -> impl FnMut(SegmentProgress) + Send + 'static {
    let mut bar: Option<Bar> = None;
    move |progress| {
        let bar = bar.get_or_insert_with(|| {
            tqdm!(
                total = progress.total,
                unit = " seg".to_owned(),
                dynamic_ncols = true
            )
        });
        bar.set_description(format!("{} KiB", progress.bytes_written / 1024));
        let _ = bar.update_to(progress.done);
        if progress.done == progress.total {
            eprintln!();
        }
    }
}

fn run_license(url: &str, cdm: Option<&Path>, config_path: Option<&Path>) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let fetcher = http_fetcher(&config)?;

    let manifest = MediaManifest::parse(&fetcher.fetch(url)?, url)?;
    let init = fetcher.fetch(&manifest.init_uri)?;
    let stream = ResolvedStream::new(manifest, init)?;
    let Some(header) = stream.protection.header() else {
        info!("Stream is not protected");
        return Ok(());
    };

    let mut client = match KeySource::license(load_credential(cdm, &config)?, &config)? {
        KeySource::License(client) => client,
        KeySource::Manual { .. } => anyhow::bail!("Expected a license key source"),
    };
    client.prepare_privacy()?;
    let keys = client.acquire(header)?;
    info!("[+] License Parsed Successfully");

    for (kid, key) in keys.iter() {
        println!("{}:{}", kid, key.to_hex());
    }
    Ok(())
}

fn run_pssh(input: &str) -> anyhow::Result<()> {
    let path = Path::new(input);
    let bytes = if path.is_file() {
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
    } else {
        input.trim().as_bytes().to_vec()
    };

    match protection::parse(&bytes)? {
        Protection::Unprotected => info!("No protection found"),
        Protection::Protected(header) => {
            info!("System ID: {}", header.system_id);
            if header.key_ids.is_empty() {
                warn!("No key ids declared");
            }
            for kid in &header.key_ids {
                info!(" + Key ID: {}", kid);
            }
            if let Some(license_url) = &header.license_url {
                info!(" + License URL: {}", license_url);
            }
            info!(" + PSSH: {}", header.to_pssh()?.to_base64());
        }
    }
    Ok(())
}

fn run_device(wvd_path: &Path) -> anyhow::Result<()> {
    let device = DeviceCredential::from_path(wvd_path).context("Failed to load WVD")?;
    info!("Widevine Device {}", wvd_path.display());
    info!(" + Type: {:?}", device.device_type);
    info!(" + System ID: {}", device.system_id);
    info!(" + Security Level: {}", device.security_level);
    info!(" + Flags: {}", device.flags);
    info!(" + Private Key: {} bit", device.private_key.n().bits());
    for (depth, cert) in device.certificate_chain.iter().enumerate() {
        info!(
            " + Certificate {}: {:?}",
            depth,
            cert.certificate_type()
        );
    }
    Ok(())
}
