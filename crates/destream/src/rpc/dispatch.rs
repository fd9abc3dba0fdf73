//! Job bookkeeping for one batch at a time.
//!
//! [`Dispatcher`] performs no I/O. It turns daemon events into job state
//! transitions and tells the caller which requests to send next, and when the
//! batch has drained.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use super::{
    job::{segment_file_name, DownloadJob, JobQueue, JobStatus, ProgressState},
    message::{DaemonEvent, MulticallElement, RequestId, RpcRequest},
};
use crate::error::{DestreamError, DestreamResult};

#[derive(Debug, Clone)]
pub enum Action {
    Send(RpcRequest),
    Resolve(DownloadReport),
}

/// Outcome of a drained batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub total: usize,
    /// Downloaded files, in submission order.
    pub files: Vec<PathBuf>,
    /// URLs that were given up on.
    pub abandoned: Vec<String>,
}

impl DownloadReport {
    pub fn is_complete(&self) -> bool {
        self.abandoned.is_empty()
    }

    pub fn into_result(self) -> DestreamResult<Vec<PathBuf>> {
        if self.is_complete() {
            Ok(self.files)
        } else {
            Err(DestreamError::PartialDownload {
                failed: self.abandoned.len(),
                total: self.total,
            })
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EarlyEvent {
    Complete,
    Error,
}

/// What a status reply tells us about a failed job.
#[derive(Debug, Default)]
struct Recovered {
    uri: Option<String>,
    path: Option<String>,
    dir: Option<String>,
}

#[derive(Debug)]
pub struct Dispatcher {
    queue: JobQueue,
    progress: ProgressState,
    batch: u64,
    next_local_id: u64,
    resolved: bool,

    max_retries: u32,
    retry_budget: Option<usize>,
    retries_left: usize,

    /// Failed jobs waiting for their status, keyed by the failed gid.
    status_pending: HashMap<String, u64>,
    /// Events that arrived before the ack carrying their gid.
    unclaimed: HashMap<String, EarlyEvent>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new(1, None)
    }
}

impl Dispatcher {
    /// `retry_budget` caps the resubmissions of a whole batch.
    /// It defaults to a tenth of the batch size, but at least 3.
    pub fn new(max_retries: u32, retry_budget: Option<usize>) -> Self {
        Self {
            queue: JobQueue::new(),
            progress: ProgressState::default(),
            batch: 0,
            next_local_id: 1,
            resolved: true,
            max_retries,
            retry_budget,
            retries_left: 0,
            status_pending: HashMap::new(),
            unclaimed: HashMap::new(),
        }
    }

    pub fn progress(&self) -> &ProgressState {
        &self.progress
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    /// Whether a batch is waiting to drain.
    pub fn is_busy(&self) -> bool {
        !self.resolved
    }

    /// Starts a new batch and returns the submission request for it.
    pub fn start_batch(&mut self, urls: &[String], output_dir: &Path) -> RpcRequest {
        self.batch += 1;
        self.queue = JobQueue::new();
        self.progress = ProgressState::new(urls.len());
        self.status_pending.clear();
        self.unclaimed.clear();
        self.retries_left = self
            .retry_budget
            .unwrap_or_else(|| (urls.len() / 10).max(3));

        let mut calls = Vec::with_capacity(urls.len());
        for (index, url) in urls.iter().enumerate() {
            let job = DownloadJob::new(
                self.next_local_id,
                url.clone(),
                output_dir.to_path_buf(),
                segment_file_name(index + 1),
            );
            self.next_local_id += 1;
            calls.push(MulticallElement::add_uri(
                &job.url,
                &job.file_name,
                &job.output_dir,
            ));
            self.queue.push(job);
        }
        self.queue.mark_submitted();
        self.resolved = urls.is_empty();

        tracing::debug!("Submitting batch {} with {} segments", self.batch, urls.len());
        RpcRequest::multicall(self.batch, calls)
    }

    pub fn handle(&mut self, event: DaemonEvent) -> Vec<Action> {
        let mut actions = Vec::new();
        match event {
            DaemonEvent::Ack { batch, gids } => self.on_ack(batch, gids, &mut actions),
            DaemonEvent::Resubmitted { local_id, gid } => {
                let is_waiting = self
                    .queue
                    .get(local_id)
                    .is_some_and(|job| job.status == JobStatus::Resubmitted);
                if is_waiting {
                    self.bind(local_id, gid, &mut actions);
                } else {
                    tracing::debug!("Ignoring stale resubmission of job {local_id}");
                }
            }
            DaemonEvent::Complete { gid } => self.on_complete(gid, &mut actions),
            DaemonEvent::Error { gid } => self.on_error(gid, &mut actions),
            DaemonEvent::Status {
                gid,
                uri,
                path,
                dir,
            } => {
                if let Some(local_id) = self.status_pending.remove(&gid) {
                    let recovered = Recovered { uri, path, dir };
                    self.resubmit(local_id, recovered, &mut actions);
                }
            }
            DaemonEvent::StatUpdate { download_speed } => {
                self.progress.last_throughput = Some(download_speed);
                if let Some(speed) = self.progress.throughput_mb() {
                    tracing::debug!("Download speed: {speed:.2} MB/s");
                }
            }
            DaemonEvent::RequestFailed { id, code, message } => {
                self.on_request_failed(id, code, message, &mut actions)
            }
            DaemonEvent::ShutdownAck => {}
            DaemonEvent::Unknown(value) => tracing::debug!("Ignoring daemon message: {value}"),
            DaemonEvent::Malformed { reason } => {
                tracing::error!("Malformed message from daemon: {reason}")
            }
        }
        self.check_drained(&mut actions);
        actions
    }

    fn on_ack(
        &mut self,
        batch: u64,
        gids: Vec<Result<String, String>>,
        actions: &mut Vec<Action>,
    ) {
        if batch != self.batch || self.resolved {
            tracing::debug!("Ignoring ack of stale batch {batch}");
            return;
        }

        let submitted: Vec<u64> = self
            .queue
            .jobs()
            .filter(|job| job.status == JobStatus::Submitted)
            .map(|job| job.local_id)
            .collect();
        if submitted.len() != gids.len() {
            tracing::error!(
                "Daemon acknowledged {} of {} submitted segments",
                gids.len(),
                submitted.len()
            );
        }
        self.progress.total = gids.len();

        for (local_id, gid) in submitted.into_iter().zip(gids) {
            match gid {
                Ok(gid) => self.bind(local_id, gid, actions),
                Err(reason) => self.abandon(local_id, &reason),
            }
        }
    }

    fn bind(&mut self, local_id: u64, gid: String, actions: &mut Vec<Action>) {
        self.queue.bind(local_id, gid.clone());
        match self.unclaimed.remove(&gid) {
            Some(EarlyEvent::Complete) => self.on_complete(gid, actions),
            Some(EarlyEvent::Error) => self.on_error(gid, actions),
            None => {}
        }
    }

    fn on_complete(&mut self, gid: String, actions: &mut Vec<Action>) {
        let Some(local_id) = self.queue.claim(&gid) else {
            self.remember(gid, EarlyEvent::Complete);
            return;
        };
        let Some(job) = self.queue.get_mut(local_id) else {
            return;
        };
        job.status = JobStatus::Complete;
        self.progress.completed += 1;

        let filename = &job.file_name;
        let done = self.progress.completed;
        let total = self.progress.total;
        let percentage = self.progress.percentage();
        tracing::info!("{filename} finished. ({done} / {total} or {percentage:.2}%)");

        actions.push(Action::Send(RpcRequest::global_stat()));
    }

    fn on_error(&mut self, gid: String, actions: &mut Vec<Action>) {
        let Some(local_id) = self.queue.claim(&gid) else {
            self.remember(gid, EarlyEvent::Error);
            return;
        };
        let Some(job) = self.queue.get_mut(local_id) else {
            return;
        };
        job.status = JobStatus::Failed;
        tracing::warn!("Failed to download {}", job.file_name);

        if job.retry_count < self.max_retries && self.retries_left > 0 {
            // reserved now, errors can arrive faster than status replies
            self.retries_left -= 1;
            self.status_pending.insert(gid.clone(), local_id);
            actions.push(Action::Send(RpcRequest::tell_status(&gid)));
        } else {
            self.abandon(local_id, "retries exhausted");
        }
    }

    /// Completion events may overtake the ack that tells us their gid.
    fn remember(&mut self, gid: String, event: EarlyEvent) {
        if self.resolved {
            tracing::debug!("Ignoring event for unknown gid {gid}");
        } else {
            self.unclaimed.insert(gid, event);
        }
    }

    fn resubmit(&mut self, local_id: u64, recovered: Recovered, actions: &mut Vec<Action>) {
        let Some(job) = self.queue.get_mut(local_id) else {
            return;
        };
        if let Some(uri) = recovered.uri {
            job.url = uri;
        }
        if let Some(dir) = recovered.dir.filter(|dir| !dir.is_empty()) {
            job.output_dir = PathBuf::from(dir);
        }
        let file_name = recovered.path.as_deref().map(Path::new).and_then(Path::file_name);
        if let Some(file_name) = file_name {
            job.file_name = file_name.to_string_lossy().into_owned();
        }
        job.retry_count += 1;
        job.remote_id = None;
        job.status = JobStatus::Resubmitted;

        tracing::warn!(
            "Retrying {} ({}/{})...",
            job.file_name,
            job.retry_count,
            self.max_retries
        );
        actions.push(Action::Send(RpcRequest::add_uri(
            local_id,
            &job.url,
            &job.file_name,
            &job.output_dir,
        )));
    }

    fn abandon(&mut self, local_id: u64, reason: &str) {
        if let Some(job) = self.queue.get_mut(local_id) {
            tracing::error!("Giving up on {} ({}): {reason}", job.file_name, job.url);
            job.status = JobStatus::Abandoned;
        }
    }

    fn on_request_failed(
        &mut self,
        id: Option<RequestId>,
        code: i64,
        message: String,
        actions: &mut Vec<Action>,
    ) {
        match id {
            Some(RequestId::Status(gid)) => {
                // fall back to what we submitted
                if let Some(local_id) = self.status_pending.remove(&gid) {
                    tracing::warn!("Status query for {gid} failed: {message}");
                    self.resubmit(local_id, Recovered::default(), actions);
                }
            }
            Some(RequestId::Retry(local_id)) => {
                let is_waiting = self
                    .queue
                    .get(local_id)
                    .is_some_and(|job| job.status == JobStatus::Resubmitted);
                if is_waiting {
                    self.abandon(local_id, &message);
                }
            }
            Some(RequestId::Submit(batch)) if batch == self.batch && !self.resolved => {
                let submitted: Vec<u64> = self
                    .queue
                    .jobs()
                    .filter(|job| job.status == JobStatus::Submitted)
                    .map(|job| job.local_id)
                    .collect();
                for local_id in submitted {
                    self.abandon(local_id, &message);
                }
            }
            Some(id) => tracing::warn!("Request {id} failed ({code}): {message}"),
            None => tracing::warn!("Daemon error ({code}): {message}"),
        }
    }

    fn check_drained(&mut self, actions: &mut Vec<Action>) {
        if self.resolved || !self.queue.is_drained() {
            return;
        }
        self.resolved = true;
        let report = self.report();
        self.log_summary("finished", &report);
        actions.push(Action::Resolve(report));
    }

    /// Drops the running batch, returning what had completed so far.
    ///
    /// Unfinished jobs are reported as abandoned.
    pub fn cancel(&mut self) -> Option<DownloadReport> {
        if self.resolved {
            return None;
        }
        self.resolved = true;
        self.status_pending.clear();
        self.unclaimed.clear();
        let report = self.report();
        self.log_summary("cancelled", &report);
        Some(report)
    }

    fn report(&self) -> DownloadReport {
        let mut report = DownloadReport {
            total: self.queue.len(),
            ..Default::default()
        };
        for job in self.queue.jobs() {
            match job.status {
                JobStatus::Complete => report.files.push(job.output_path()),
                _ => report.abandoned.push(job.url.clone()),
            }
        }
        report
    }

    fn log_summary(&self, outcome: &str, report: &DownloadReport) {
        let completed = report.files.len();
        let total = report.total;
        match self.progress.throughput_mb() {
            Some(speed) => tracing::info!(
                "Batch {} {outcome}: {completed} / {total} segments (last speed {speed:.2} MB/s)",
                self.batch
            ),
            None => tracing::info!(
                "Batch {} {outcome}: {completed} / {total} segments",
                self.batch
            ),
        }
    }
}
