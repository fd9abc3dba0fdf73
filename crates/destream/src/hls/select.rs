use super::{AudioRendition, RenditionSet, VideoRendition};
use crate::error::{DestreamError, DestreamResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenditionKind {
    Video,
    Audio,
}

/// Picks one rendition when a master playlist offers several.
///
/// Implementations may prompt the user; the resolver itself never does.
pub trait RenditionChooser {
    fn choose(&self, kind: RenditionKind, labels: &[String]) -> DestreamResult<usize>;
}

impl<F> RenditionChooser for F
where
    F: Fn(RenditionKind, &[String]) -> DestreamResult<usize>,
{
    fn choose(&self, kind: RenditionKind, labels: &[String]) -> DestreamResult<usize> {
        self(kind, labels)
    }
}

/// Always picks the given indexes.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexChooser {
    pub video: usize,
    pub audio: usize,
}

impl RenditionChooser for IndexChooser {
    fn choose(&self, kind: RenditionKind, _labels: &[String]) -> DestreamResult<usize> {
        Ok(match kind {
            RenditionKind::Video => self.video,
            RenditionKind::Audio => self.audio,
        })
    }
}

/// Picks the largest video and the first audio track.
#[derive(Debug, Clone, Copy, Default)]
pub struct BestQuality;

impl RenditionChooser for BestQuality {
    fn choose(&self, kind: RenditionKind, labels: &[String]) -> DestreamResult<usize> {
        if kind == RenditionKind::Audio {
            return Ok(0);
        }
        let pixels = |label: &String| {
            label
                .split_once('x')
                .and_then(|(w, h)| Some(w.parse::<u64>().ok()? * h.parse::<u64>().ok()?))
                .unwrap_or_default()
        };
        Ok(labels
            .iter()
            .enumerate()
            .max_by_key(|(_, label)| pixels(label))
            .map(|(i, _)| i)
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedRenditions {
    pub video: VideoRendition,
    pub audio: Option<AudioRendition>,
}

fn pick<C>(chooser: &C, kind: RenditionKind, labels: Vec<String>) -> DestreamResult<usize>
where
    C: RenditionChooser + ?Sized,
{
    if labels.len() == 1 {
        return Ok(0);
    }
    let index = chooser.choose(kind, &labels)?;
    if index >= labels.len() {
        return Err(DestreamError::RenditionOutOfRange {
            index,
            count: labels.len(),
        });
    }
    Ok(index)
}

impl RenditionSet {
    /// Chooses one video and at most one audio rendition.
    ///
    /// A single candidate is taken without consulting `chooser`.
    pub fn select<C>(&self, chooser: &C) -> DestreamResult<SelectedRenditions>
    where
        C: RenditionChooser + ?Sized,
    {
        if self.videos.is_empty() {
            return Err(DestreamError::NoRenditions);
        }

        let labels = self.videos.iter().map(VideoRendition::label).collect();
        let video = self.videos[pick(chooser, RenditionKind::Video, labels)?].clone();

        let audio = if self.audios.is_empty() {
            None
        } else {
            let labels = self.audios.iter().map(|a| a.label.clone()).collect();
            Some(self.audios[pick(chooser, RenditionKind::Audio, labels)?].clone())
        };

        Ok(SelectedRenditions { video, audio })
    }
}
