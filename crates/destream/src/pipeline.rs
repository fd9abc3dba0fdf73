use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
};

use url::Url;

use crate::{
    decrypt::{concat_decrypt, fetch_key, EncryptionKey},
    error::{DestreamError, DestreamResult},
    fetch::AuthenticatedFetch,
    hls::{resolve_master, resolve_media, RenditionChooser},
    merge::{CodecOverrides, MuxRequest, Muxer},
    metadata::sanitize_file_name,
    rpc::SegmentDownloader,
};

/// One video to download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRequest {
    pub title: String,
    /// URL of the HLS master playlist.
    pub playback_url: String,
    pub output_path: PathBuf,
    pub captions_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Parent of the per-video working directories.
    pub tmp_root: PathBuf,
    pub keep_segments: bool,
    /// Keep whatever the muxer wrote when it fails.
    pub keep_failed_output: bool,
    /// Leave videos alone whose output file already exists.
    pub skip_existing: bool,
    pub codecs: CodecOverrides,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            tmp_root: std::env::temp_dir().join("destream"),
            keep_segments: false,
            keep_failed_output: false,
            skip_existing: false,
            codecs: CodecOverrides::default(),
        }
    }
}

#[derive(Debug)]
pub enum VideoOutcome {
    Done(PathBuf),
    Skipped,
    Failed(DestreamError),
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub outcomes: Vec<(String, VideoOutcome)>,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, VideoOutcome::Failed(_)))
            .count()
    }
}

/// A media playlist ready to be downloaded.
struct Track {
    name: &'static str,
    segment_urls: Vec<String>,
    key: Option<EncryptionKey>,
}

pub struct Pipeline<F, C, D, M> {
    fetch: F,
    chooser: C,
    downloader: D,
    muxer: M,
    options: PipelineOptions,
}

impl<F, C, D, M> Pipeline<F, C, D, M>
where
    F: AuthenticatedFetch,
    C: RenditionChooser,
    D: SegmentDownloader,
    M: Muxer,
{
    pub fn new(fetch: F, chooser: C, downloader: D, muxer: M, options: PipelineOptions) -> Self {
        Self {
            fetch,
            chooser,
            downloader,
            muxer,
            options,
        }
    }

    pub fn into_downloader(self) -> D {
        self.downloader
    }

    fn workdir(&self, video: &VideoRequest) -> PathBuf {
        let stem = video
            .output_path
            .file_stem()
            .map(|stem| sanitize_file_name(&stem.to_string_lossy()))
            .unwrap_or_else(|| sanitize_file_name(&video.title));
        self.options.tmp_root.join(stem)
    }

    async fn cleanup(&self, workdir: &Path) {
        if self.options.keep_segments {
            tracing::info!("Keeping segments in {}", workdir.display());
            return;
        }
        if let Err(e) = tokio::fs::remove_dir_all(workdir).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove {}: {e}", workdir.display());
            }
        }
    }

    /// Downloads, decrypts and muxes one video into `video.output_path`.
    pub async fn process(&mut self, video: &VideoRequest) -> DestreamResult<PathBuf> {
        let workdir = self.workdir(video);
        let result = self.process_in(video, &workdir).await;
        self.cleanup(&workdir).await;
        result
    }

    async fn prepare_track(&self, name: &'static str, uri: &str) -> DestreamResult<Track> {
        let base = Url::parse(uri)?;
        let text = self.fetch.get_text(uri).await?;
        let playlist = resolve_media(&text, Some(&base))?;

        let key = match &playlist.encryption {
            Some(_) if playlist.segments.is_empty() => None,
            Some(directive) => Some(fetch_key(directive, &self.fetch).await?),
            None => {
                tracing::info!("{name} playlist is not encrypted");
                None
            }
        };

        Ok(Track {
            name,
            segment_urls: playlist.segment_uris(),
            key,
        })
    }

    async fn process_in(
        &mut self,
        video: &VideoRequest,
        workdir: &Path,
    ) -> DestreamResult<PathBuf> {
        tracing::info!("Downloading {}", video.title);

        let master_url = Url::parse(&video.playback_url)?;
        let master = self.fetch.get_text(&video.playback_url).await?;
        let renditions = resolve_master(&master, Some(&master_url))?;
        let selected = renditions.select(&self.chooser)?;
        tracing::info!("Selected {} video", selected.video.label());

        let mut tracks = vec![self.prepare_track("video", &selected.video.uri).await?];
        if let Some(audio) = &selected.audio {
            tracing::info!("Selected audio {}", audio.label);
            tracks.push(self.prepare_track("audio", &audio.uri).await?);
        }

        let mut downloaded = Vec::with_capacity(tracks.len());
        for track in tracks {
            let dir = workdir.join(track.name);
            let urls = track.segment_urls.clone();
            tracing::info!("Downloading {} {} segments", urls.len(), track.name);
            let files = self.downloader.download_all(urls, &dir).await?.into_result()?;
            downloaded.push((track, files));
        }

        let mut streams = Vec::with_capacity(downloaded.len());
        for (track, files) in downloaded {
            let output = workdir.join(format!("{}.ts", track.name));
            let target = output.clone();
            let written = tokio::task::spawn_blocking(move || {
                concat_decrypt(&files, track.key.as_ref(), target)
            })
            .await
            .map_err(io::Error::other)??;
            tracing::debug!("Wrote {written} bytes to {}", output.display());
            streams.push(output);
        }

        let subtitle = match &video.captions_url {
            Some(url) => self.fetch_captions(url, workdir).await,
            None => None,
        };

        if let Some(parent) = video.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let request = MuxRequest {
            video: &streams[0],
            audio: streams.get(1).map(PathBuf::as_path),
            subtitle: subtitle.as_deref(),
            output: &video.output_path,
            codecs: &self.options.codecs,
        };
        if let Err(e) = self.muxer.mux(request).await {
            if !self.options.keep_failed_output {
                let _ = tokio::fs::remove_file(&video.output_path).await;
            }
            return Err(e);
        }

        Ok(video.output_path.clone())
    }

    async fn fetch_captions(&self, url: &str, workdir: &Path) -> Option<PathBuf> {
        let path = workdir.join("captions.vtt");
        let result = async {
            let bytes = self.fetch.get_bytes(url).await?;
            tokio::fs::write(&path, bytes).await?;
            DestreamResult::Ok(())
        };
        match result.await {
            Ok(()) => Some(path),
            Err(e) => {
                tracing::warn!("Failed to download captions, continuing without them: {e}");
                None
            }
        }
    }

    /// Processes `videos` one after another until `signal` fires.
    ///
    /// Fatal errors stop the run. Any other failure only skips its video.
    pub async fn run_until<S>(
        &mut self,
        videos: Vec<VideoRequest>,
        signal: S,
    ) -> DestreamResult<RunSummary>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut summary = RunSummary::default();

        for video in videos {
            if self.options.skip_existing && video.output_path.exists() {
                tracing::info!("{} already exists, skipping.", video.output_path.display());
                summary.outcomes.push((video.title, VideoOutcome::Skipped));
                continue;
            }

            let result = tokio::select! {
                result = self.process(&video) => Some(result),
                _ = &mut signal => None,
            };
            let Some(result) = result else {
                tracing::warn!("Interrupted, cleaning up {}", video.output_path.display());
                let _ = tokio::fs::remove_file(&video.output_path).await;
                self.cleanup(&self.workdir(&video)).await;
                self.downloader.abort().await;
                return Err(DestreamError::Interrupted);
            };

            match result {
                Ok(path) => {
                    tracing::info!("Done: {}", path.display());
                    summary.outcomes.push((video.title, VideoOutcome::Done(path)));
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::error!("Failed to download {}: {e}", video.title);
                    summary.outcomes.push((video.title, VideoOutcome::Failed(e)));
                }
            }
        }

        Ok(summary)
    }

    /// Like [`Pipeline::run_until`], stopping on Ctrl-C.
    pub async fn run(&mut self, videos: Vec<VideoRequest>) -> DestreamResult<RunSummary> {
        self.run_until(videos, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await
    }
}
