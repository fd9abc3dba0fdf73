//! Download orchestration through an aria2 daemon.

use std::{future::Future, path::Path};

use crate::error::DestreamResult;

pub mod daemon;
pub mod dispatch;
pub mod job;
pub mod message;
pub mod orchestrator;

pub use daemon::{Aria2Daemon, DaemonState};
pub use dispatch::{Dispatcher, DownloadReport};
pub use job::{segment_file_name, JobStatus, ProgressState, SEGMENT_EXTENSION};
pub use orchestrator::{Orchestrator, OrchestratorBuilder};

/// Downloads batches of segment URLs into a directory.
///
/// Only one batch may be in flight at a time.
pub trait SegmentDownloader {
    fn download_all(
        &mut self,
        urls: Vec<String>,
        output_dir: &Path,
    ) -> impl Future<Output = DestreamResult<DownloadReport>> + Send;

    /// Stops the running batch and closes the underlying channel.
    fn abort(&mut self) -> impl Future<Output = ()> + Send;
}
