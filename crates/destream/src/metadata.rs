use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::{
    error::{DestreamError, DestreamResult},
    fetch::ApiClient,
};

const HLS_MIME_TYPE: &str = "application/vnd.apple.mpegurl";

static VIDEO_GUID: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/video/(\w{8}-(?:\w{4}-){3}\w{12})").unwrap());

/// Extracts the video GUID out of a `.../video/<guid>` URL.
pub fn extract_guid(url: &str) -> DestreamResult<String> {
    VIDEO_GUID
        .captures(url)
        .map(|caps| caps[1].to_string())
        .ok_or_else(|| DestreamError::InvalidVideoUrl(url.to_string()))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoResponse {
    name: String,
    published_date: String,
    #[serde(default)]
    playback_urls: Vec<PlaybackUrl>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaybackUrl {
    mime_type: String,
    playback_url: String,
}

#[derive(Deserialize)]
struct TextTracks {
    #[serde(default)]
    value: Vec<TextTrack>,
}

#[derive(Deserialize)]
struct TextTrack {
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoMetadata {
    pub guid: String,
    pub title: String,
    /// Publish date as `dd-mm-yyyy`.
    pub published_date: String,
    pub playback_url: String,
    pub captions_url: Option<String>,
}

impl VideoMetadata {
    pub fn parse(guid: &str, value: serde_json::Value) -> DestreamResult<Self> {
        let response: VideoResponse = serde_json::from_value(value)
            .map_err(|e| DestreamError::InvalidMetadata(format!("{guid}: {e}")))?;

        let published_date = chrono::DateTime::parse_from_rfc3339(&response.published_date)
            .map_err(|e| DestreamError::InvalidMetadata(format!("{guid}: publishedDate {e}")))?
            .format("%d-%m-%Y")
            .to_string();

        let playback_url = response
            .playback_urls
            .into_iter()
            .find(|url| url.mime_type == HLS_MIME_TYPE)
            .map(|url| url.playback_url)
            .ok_or_else(|| DestreamError::InvalidMetadata(format!("{guid}: no HLS playback url")))?;

        Ok(Self {
            guid: guid.to_string(),
            title: response.name,
            published_date,
            playback_url,
            captions_url: None,
        })
    }

    /// `"<title> - <date>"`, stripped of characters that are not allowed in file names.
    pub fn file_stem(&self) -> String {
        sanitize_file_name(&format!("{} - {}", self.title, self.published_date))
    }

    pub fn default_output_path(&self, dir: &Path, format: &str) -> PathBuf {
        dir.join(format!("{}.{format}", self.file_stem()))
    }

    /// A path under `dir` that does not exist yet.
    ///
    /// Existing files are kept. A ` - <n>` counter is appended instead.
    pub fn output_path(&self, dir: &Path, format: &str) -> PathBuf {
        unique_path(dir, &self.file_stem(), format)
    }
}

/// Fetches the metadata of a video, and its captions URL when `captions` is set.
pub async fn fetch_metadata(
    api: &ApiClient,
    guid: &str,
    captions: bool,
) -> DestreamResult<VideoMetadata> {
    let value = api.call_api(&format!("videos/{guid}")).await?;
    let mut metadata = VideoMetadata::parse(guid, value)?;

    if captions {
        match api.call_api(&format!("videos/{guid}/texttracks")).await {
            Ok(value) => {
                metadata.captions_url = serde_json::from_value::<TextTracks>(value)
                    .ok()
                    .and_then(|tracks| tracks.value.into_iter().next())
                    .map(|track| track.url);
            }
            Err(e) => tracing::warn!("Failed to fetch captions of {guid}: {e}"),
        }
    }

    Ok(metadata)
}

pub fn sanitize_file_name(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .filter(|c| !c.is_control())
        .filter(|c| !matches!(c, '/' | '\\' | '?' | '<' | '>' | ':' | '*' | '|' | '"'))
        .collect();
    sanitized.trim().trim_end_matches('.').to_string()
}

fn unique_path(dir: &Path, stem: &str, extension: &str) -> PathBuf {
    let mut path = dir.join(format!("{stem}.{extension}"));
    let mut counter = 0;
    while path.exists() {
        counter += 1;
        path = dir.join(format!("{stem} - {counter}.{extension}"));
    }
    path
}
