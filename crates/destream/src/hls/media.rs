use once_cell::sync::Lazy;
use regex::Regex;
use url::Url;

use super::join_uri;
use crate::error::{DestreamError, DestreamResult};

static KEY_DIRECTIVE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^#EXT-X-KEY:METHOD=(.*?),URI="(.*?)",IV=0[xX]([0-9a-fA-F]+)"#).unwrap()
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub uri: String,
}

/// The `#EXT-X-KEY` line of a media playlist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptionDirective {
    pub method: String,
    pub key_uri: String,
    pub iv_hex: String,
}

impl EncryptionDirective {
    /// Finds the encryption directive of a media playlist.
    ///
    /// Only the first `#EXT-X-KEY` line is considered: key rotation is not
    /// supported, content is expected to use a single key for the whole playlist.
    ///
    /// Returns `Ok(None)` when the playlist carries no key line at all (or
    /// `METHOD=NONE`), and [`DestreamError::NoEncryptionInfo`] when a key line
    /// exists but does not follow `METHOD=<alg>,URI="<uri>",IV=0x<hex>`.
    pub fn parse(text: &str) -> DestreamResult<Option<Self>> {
        let Some(line) = text
            .lines()
            .map(str::trim)
            .find(|line| line.starts_with("#EXT-X-KEY"))
        else {
            return Ok(None);
        };
        tracing::debug!("Encryption line in m3u8: {line}");

        if line.starts_with("#EXT-X-KEY:METHOD=NONE") {
            return Ok(None);
        }

        let captures = KEY_DIRECTIVE
            .captures(line)
            .ok_or(DestreamError::NoEncryptionInfo)?;
        Ok(Some(Self {
            method: captures[1].to_string(),
            key_uri: captures[2].to_string(),
            iv_hex: captures[3].to_string(),
        }))
    }
}

/// A parsed media playlist. Segment order is the concatenation order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    pub encryption: Option<EncryptionDirective>,
}

impl MediaPlaylist {
    pub fn segment_uris(&self) -> Vec<String> {
        self.segments.iter().map(|s| s.uri.clone()).collect()
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }
}

/// Parses a media playlist. When `base` is given, segment and key URIs are
/// resolved against it.
pub fn resolve_media(text: &str, base: Option<&Url>) -> DestreamResult<MediaPlaylist> {
    let playlist = m3u8_rs::parse_media_playlist_res(text.as_bytes())
        .map_err(|_| DestreamError::ManifestParse("invalid media playlist".to_string()))?;

    let segments = playlist
        .segments
        .iter()
        .map(|segment| {
            Ok(Segment {
                uri: join_uri(base, &segment.uri)?,
            })
        })
        .collect::<DestreamResult<Vec<_>>>()?;

    let encryption = match EncryptionDirective::parse(text)? {
        Some(mut directive) => {
            directive.key_uri = join_uri(base, &directive.key_uri)?;
            Some(directive)
        }
        None => None,
    };

    Ok(MediaPlaylist {
        segments,
        encryption,
    })
}
