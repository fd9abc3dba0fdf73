mod master;
mod media;
mod select;

pub use m3u8_rs;
pub use master::*;
pub use media::*;
pub use select::*;

use url::Url;

use crate::error::DestreamResult;

/// Joins a playlist entry with the playlist location when one is known.
pub(crate) fn join_uri(base: Option<&Url>, uri: &str) -> DestreamResult<String> {
    Ok(match base {
        Some(base) => base.join(uri)?.to_string(),
        None => uri.to_string(),
    })
}
