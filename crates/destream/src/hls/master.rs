use m3u8_rs::AlternativeMediaType;
use url::Url;

use super::join_uri;
use crate::error::{DestreamError, DestreamResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoRendition {
    pub width: u64,
    pub height: u64,
    pub bandwidth: u64,
    pub uri: String,
}

impl VideoRendition {
    pub fn label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioRendition {
    pub label: String,
    pub uri: String,
}

/// Renditions offered by a master playlist, in playlist order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenditionSet {
    pub videos: Vec<VideoRendition>,
    pub audios: Vec<AudioRendition>,
}

/// Parses a master playlist into its video and audio candidates.
///
/// Variants without a `RESOLUTION` attribute are not video candidates. Audio
/// candidates come from `#EXT-X-MEDIA:TYPE=AUDIO` entries carrying a URI whose
/// `GROUP-ID` is referenced by a video candidate's `AUDIO` attribute. When
/// `base` is given, every URI is resolved against it.
pub fn resolve_master(text: &str, base: Option<&Url>) -> DestreamResult<RenditionSet> {
    let playlist = m3u8_rs::parse_master_playlist_res(text.as_bytes())
        .map_err(|_| DestreamError::ManifestParse("invalid master playlist".to_string()))?;

    let mut videos = Vec::new();
    let mut audio_groups: Vec<&str> = Vec::new();
    for variant in playlist.variants.iter().filter(|v| !v.is_i_frame) {
        let Some(resolution) = &variant.resolution else {
            tracing::debug!("Skipping variant without resolution: {}", variant.uri);
            continue;
        };
        if let Some(group) = variant.audio.as_deref() {
            if !audio_groups.contains(&group) {
                audio_groups.push(group);
            }
        }
        videos.push(VideoRendition {
            width: resolution.width,
            height: resolution.height,
            bandwidth: variant.bandwidth,
            uri: join_uri(base, &variant.uri)?,
        });
    }

    if videos.is_empty() {
        return Err(DestreamError::NoRenditions);
    }

    let mut audios: Vec<AudioRendition> = Vec::new();
    for media in playlist
        .alternatives
        .iter()
        .filter(|m| m.media_type == AlternativeMediaType::Audio)
        .filter(|m| audio_groups.contains(&m.group_id.as_str()))
    {
        let Some(uri) = &media.uri else {
            continue;
        };
        let uri = join_uri(base, uri)?;
        // the same track is often listed once per group
        if audios.iter().any(|a| a.uri == uri) {
            continue;
        }
        let label = match &media.language {
            Some(language) => format!("{} ({language})", media.name),
            None => media.name.clone(),
        };
        audios.push(AudioRendition { label, uri });
    }

    Ok(RenditionSet { videos, audios })
}
