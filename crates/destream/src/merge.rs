use std::{
    ffi::OsString,
    future::Future,
    path::{Path, PathBuf},
};

use tokio::process::Command;

use crate::error::{DestreamError, DestreamResult};

/// Codec passed to the muxer for one stream kind.
///
/// `copy` keeps the stream as is and `none` drops it from the output.
/// Anything else is handed to the muxer as an encoder name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecOverrides {
    pub video: String,
    pub audio: String,
}

impl Default for CodecOverrides {
    fn default() -> Self {
        Self {
            video: "copy".to_string(),
            audio: "copy".to_string(),
        }
    }
}

pub struct MuxRequest<'a> {
    pub video: &'a Path,
    pub audio: Option<&'a Path>,
    pub subtitle: Option<&'a Path>,
    pub output: &'a Path,
    pub codecs: &'a CodecOverrides,
}

pub trait Muxer {
    fn mux(&self, request: MuxRequest<'_>) -> impl Future<Output = DestreamResult<()>> + Send;
}

pub struct FfmpegMuxer {
    binary: PathBuf,
}

impl FfmpegMuxer {
    pub fn new<P>(binary: P) -> Self
    where
        P: Into<PathBuf>,
    {
        Self {
            binary: binary.into(),
        }
    }

    /// Looks up `ffmpeg` on `PATH`.
    pub fn locate() -> DestreamResult<Self> {
        let binary = which::which("ffmpeg").map_err(DestreamError::MissingMuxer)?;
        Ok(Self::new(binary))
    }

    pub fn command_args(request: &MuxRequest<'_>) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-hide_banner".into(), "-n".into()];

        let mut inputs = vec![request.video];
        inputs.extend(request.audio);
        inputs.extend(request.subtitle);
        for input in &inputs {
            args.push("-i".into());
            args.push(input.as_os_str().to_owned());
        }
        for index in 0..inputs.len() {
            args.push("-map".into());
            args.push(index.to_string().into());
        }

        match request.codecs.video.as_str() {
            "none" => args.push("-vn".into()),
            codec => args.extend(["-c:v".into(), codec.into()]),
        }
        match request.codecs.audio.as_str() {
            "none" => args.push("-an".into()),
            codec => args.extend(["-c:a".into(), codec.into()]),
        }
        if request.subtitle.is_some() {
            let is_mp4 = request
                .output
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("mp4"));
            let codec = if is_mp4 { "mov_text" } else { "copy" };
            args.extend(["-c:s".into(), codec.into()]);
        }

        args.push(request.output.as_os_str().to_owned());
        args
    }
}

impl Muxer for FfmpegMuxer {
    async fn mux(&self, request: MuxRequest<'_>) -> DestreamResult<()> {
        tracing::debug!("Merging with ffmpeg CLI...");

        let status = Command::new(&self.binary)
            .args(Self::command_args(&request))
            .kill_on_drop(true)
            .status()
            .await?;
        if !status.success() {
            return Err(DestreamError::MuxerFailed {
                code: status.code(),
            });
        }

        tracing::info!("{} merged.", request.output.display());
        Ok(())
    }
}
