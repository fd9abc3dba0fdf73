use std::{
    collections::HashMap,
    io,
    path::PathBuf,
    process::ExitCode,
};

use anyhow::Context;
use clap::Parser;
use destream::{
    fetch::ApiClient,
    hls::{RenditionChooser, RenditionKind},
    merge::{CodecOverrides, FfmpegMuxer},
    metadata::{extract_guid, fetch_metadata},
    pipeline::{Pipeline, PipelineOptions, VideoOutcome, VideoRequest},
    rpc::{Aria2Daemon, Orchestrator},
    session::{Session, SessionProvider, StaticSession, TokenCache},
    DestreamError,
};

#[derive(Parser, Debug)]
#[clap(name = "destream", version, about = "Download encrypted HLS videos through aria2c")]
struct DestreamArgs {
    /// Video URLs
    #[clap(short = 'i', long = "video-urls", num_args = 1..)]
    video_urls: Vec<String>,

    /// Path to a text file with one video URL per line
    #[clap(short = 'f', long)]
    input_file: Option<PathBuf>,

    /// Directory the muxed videos are written to
    #[clap(short = 'o', long, default_value = "videos")]
    output_dir: PathBuf,

    /// Temporary directory for segments
    #[clap(short = 't', long)]
    tmp_dir: Option<PathBuf>,

    /// Bearer token used to call the video API
    #[clap(long, env = "DESTREAM_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// API gateway base URL, required together with --token
    #[clap(long, env = "DESTREAM_API_BASE")]
    api_base: Option<String>,

    /// Session cache written by a previous login
    #[clap(long, default_value = ".token_cache")]
    token_cache: PathBuf,

    /// Path to the aria2c executable. Looked up on PATH by default
    #[clap(long)]
    aria2c: Option<PathBuf>,

    /// Port of the aria2c JSON-RPC server. A free one is picked by default
    #[clap(long)]
    rpc_port: Option<u16>,

    /// Attempts to connect to the aria2c JSON-RPC server
    #[clap(long, default_value = "10")]
    connect_attempts: u32,

    /// Times a failed segment is submitted again
    #[clap(long, default_value = "1")]
    segment_retries: u32,

    /// Resubmissions allowed per track, defaults to a tenth of its segments
    #[clap(long)]
    retry_budget: Option<usize>,

    /// Global aria2c option as key=value, e.g. max-concurrent-downloads=16
    #[clap(long = "aria2-option", value_parser = parse_key_value)]
    aria2_options: Vec<(String, String)>,

    /// Video rendition to pick without asking
    #[clap(long)]
    video_index: Option<usize>,

    /// Audio rendition to pick without asking
    #[clap(long)]
    audio_index: Option<usize>,

    /// Audio codec passed to ffmpeg. Use `none` to drop the audio
    #[clap(long, default_value = "copy")]
    acodec: String,

    /// Video codec passed to ffmpeg. Use `none` to drop the video
    #[clap(long, default_value = "copy")]
    vcodec: String,

    /// Output container
    #[clap(long, default_value = "mkv", value_parser = ["mkv", "mp4"])]
    format: String,

    /// Download closed captions when available
    #[clap(long, alias = "cc")]
    closed_captions: bool,

    /// Keep the downloaded segments
    #[clap(long)]
    keep_segments: bool,

    /// Keep the output file when ffmpeg fails
    #[clap(long)]
    no_cleanup: bool,

    /// Skip videos whose output file already exists
    #[clap(long)]
    skip: bool,

    /// Only print what would be downloaded
    #[clap(short, long)]
    simulate: bool,

    /// Debug output
    #[clap(short, long, alias = "debug")]
    verbose: bool,
}

fn parse_key_value(input: &str) -> Result<(String, String), String> {
    input
        .split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .filter(|(key, _)| !key.is_empty())
        .ok_or_else(|| format!("expected key=value, got `{input}`"))
}

/// Uses the indexes given on the command line and prompts for the rest.
struct CliChooser {
    video: Option<usize>,
    audio: Option<usize>,
}

impl RenditionChooser for CliChooser {
    fn choose(&self, kind: RenditionKind, labels: &[String]) -> destream::DestreamResult<usize> {
        let (preset, message) = match kind {
            RenditionKind::Video => (self.video, "Choose the video resolution"),
            RenditionKind::Audio => (self.audio, "Choose the audio track"),
        };
        if let Some(index) = preset {
            return Ok(index);
        }

        let answer = requestty::prompt_one(
            requestty::Question::select("rendition")
                .message(message)
                .choices(labels.iter().cloned())
                .build(),
        )
        .map_err(io::Error::other)?;
        answer
            .as_list_item()
            .map(|item| item.index)
            .ok_or(DestreamError::NoRenditions)
    }
}

impl DestreamArgs {
    async fn video_urls(&self) -> anyhow::Result<Vec<String>> {
        let mut urls = self.video_urls.clone();
        if let Some(input_file) = &self.input_file {
            let content = tokio::fs::read_to_string(input_file)
                .await
                .with_context(|| format!("Failed to read {}", input_file.display()))?;
            urls.extend(
                content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .map(str::to_string),
            );
        }
        if urls.is_empty() {
            anyhow::bail!("No video URL given, use -i or --input-file");
        }
        Ok(urls)
    }

    async fn session(&self) -> destream::DestreamResult<Session> {
        match (&self.token, &self.api_base) {
            (Some(token), Some(api_base)) => {
                StaticSession::new(Some(Session::new(token, api_base)))
                    .get_session()
                    .await
            }
            (Some(_), None) => {
                tracing::warn!("--token is ignored without --api-base");
                TokenCache::new(&self.token_cache).get_session().await
            }
            _ => TokenCache::new(&self.token_cache).get_session().await,
        }
    }

    fn aria2_options(&self) -> HashMap<String, String> {
        let mut options = HashMap::from([(
            "max-connection-per-server".to_string(),
            "8".to_string(),
        )]);
        options.extend(self.aria2_options.iter().cloned());
        options
    }

    fn pipeline_options(&self) -> PipelineOptions {
        let mut options = PipelineOptions {
            keep_segments: self.keep_segments,
            keep_failed_output: self.no_cleanup,
            skip_existing: self.skip,
            codecs: CodecOverrides {
                video: self.vcodec.clone(),
                audio: self.acodec.clone(),
            },
            ..Default::default()
        };
        if let Some(tmp_dir) = &self.tmp_dir {
            options.tmp_root = tmp_dir.clone();
        }
        options
    }
}

async fn resolve_videos(
    args: &DestreamArgs,
    api: &ApiClient,
) -> anyhow::Result<Vec<VideoRequest>> {
    let mut videos = Vec::new();
    for url in args.video_urls().await? {
        let guid = extract_guid(&url)?;
        let metadata = fetch_metadata(api, &guid, args.closed_captions).await?;
        let output_path = if args.skip {
            metadata.default_output_path(&args.output_dir, &args.format)
        } else {
            metadata.output_path(&args.output_dir, &args.format)
        };
        videos.push(VideoRequest {
            title: metadata.title,
            playback_url: metadata.playback_url,
            output_path,
            captions_url: metadata.captions_url,
        });
    }
    Ok(videos)
}

fn print_simulation(videos: &[VideoRequest]) {
    for video in videos {
        println!("Title:    {}", video.title);
        println!("Playlist: {}", video.playback_url);
        println!("Output:   {}", video.output_path.display());
        if let Some(captions) = &video.captions_url {
            println!("Captions: {captions}");
        }
        println!();
    }
}

async fn download(
    args: &DestreamArgs,
    api: ApiClient,
    videos: Vec<VideoRequest>,
) -> anyhow::Result<()> {
    let muxer = FfmpegMuxer::locate()?;
    let aria2c = Aria2Daemon::locate(args.aria2c.as_deref())?;
    let port = match args.rpc_port {
        Some(port) => port,
        None => Aria2Daemon::free_port()?,
    };
    tokio::fs::create_dir_all(&args.output_dir).await?;

    let daemon = Aria2Daemon::spawn(&aria2c, port, &[])?;
    let mut builder = Orchestrator::builder(daemon.endpoint())
        .max_attempts(args.connect_attempts)
        .max_retries(args.segment_retries)
        .supervise(daemon.exit_watch());
    if let Some(budget) = args.retry_budget {
        builder = builder.retry_budget(budget);
    }
    let orchestrator = match builder.connect().await {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            daemon.kill().await;
            return Err(e.into());
        }
    };
    orchestrator.configure(args.aria2_options()).await;

    let chooser = CliChooser {
        video: args.video_index,
        audio: args.audio_index,
    };
    let mut pipeline = Pipeline::new(api, chooser, orchestrator, muxer, args.pipeline_options());
    let result = pipeline.run(videos).await;

    if let Err(e) = pipeline.into_downloader().shutdown().await {
        tracing::warn!("Failed to shut down aria2c gracefully: {e}");
        daemon.kill().await;
    }

    let summary = result?;
    for (title, outcome) in &summary.outcomes {
        match outcome {
            VideoOutcome::Done(path) => tracing::info!("{title}: {}", path.display()),
            VideoOutcome::Skipped => tracing::info!("{title}: skipped"),
            VideoOutcome::Failed(e) => tracing::error!("{title}: {e}"),
        }
    }
    if summary.failed() > 0 {
        anyhow::bail!(
            "{} of {} videos failed to download",
            summary.failed(),
            summary.outcomes.len()
        );
    }
    Ok(())
}

async fn run(args: DestreamArgs) -> anyhow::Result<()> {
    let session = args.session().await?;
    let api = ApiClient::new(session)?;

    let videos = resolve_videos(&args, &api).await?;
    if args.simulate {
        print_simulation(&videos);
        return Ok(());
    }

    download(&args, api, videos).await
}

fn exit_code(e: &anyhow::Error) -> ExitCode {
    e.downcast_ref::<DestreamError>()
        .map(|e| ExitCode::from(e.exit_code()))
        .unwrap_or(ExitCode::FAILURE)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = DestreamArgs::parse();

    let level = if args.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e:#}");
            exit_code(&e)
        }
    }
}
