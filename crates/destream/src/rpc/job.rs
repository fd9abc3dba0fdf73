use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
};

pub const SEGMENT_EXTENSION: &str = "encr";

/// Local file name of the `index`-th segment of a batch, starting from 1.
///
/// Names are zero-padded to a fixed width so that a lexical sort of the
/// directory listing gives back the submission order.
pub fn segment_file_name(index: usize) -> String {
    format!("{index:016}.{SEGMENT_EXTENSION}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Created locally, not yet sent to the daemon.
    Pending,
    /// Sent to the daemon, waiting for a gid.
    Submitted,
    /// Acknowledged by the daemon.
    Active,
    /// Reported failed, waiting for its status to be queried.
    Failed,
    /// Sent again after a failure, waiting for a new gid.
    Resubmitted,
    Complete,
    /// Gave up after exhausting the retry budget.
    Abandoned,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Abandoned)
    }
}

#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub local_id: u64,
    /// Daemon-assigned gid, unset until acknowledged.
    pub remote_id: Option<String>,
    pub url: String,
    pub output_dir: PathBuf,
    pub file_name: String,
    pub status: JobStatus,
    pub retry_count: u32,
}

impl DownloadJob {
    pub fn new(local_id: u64, url: String, output_dir: PathBuf, file_name: String) -> Self {
        Self {
            local_id,
            remote_id: None,
            url,
            output_dir,
            file_name,
            status: JobStatus::Pending,
            retry_count: 0,
        }
    }

    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(&self.file_name)
    }
}

/// Jobs of the running batch together with the gids the daemon is working on.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: BTreeMap<u64, DownloadJob>,
    outstanding: HashMap<String, u64>,
    submitted: bool,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, job: DownloadJob) {
        self.jobs.insert(job.local_id, job);
    }

    /// Marks every pending job as submitted.
    pub fn mark_submitted(&mut self) {
        for job in self.jobs.values_mut() {
            if job.status == JobStatus::Pending {
                job.status = JobStatus::Submitted;
            }
        }
        self.submitted = !self.jobs.is_empty();
    }

    pub fn get(&self, local_id: u64) -> Option<&DownloadJob> {
        self.jobs.get(&local_id)
    }

    pub fn get_mut(&mut self, local_id: u64) -> Option<&mut DownloadJob> {
        self.jobs.get_mut(&local_id)
    }

    /// Records the gid assigned to a job and moves it to [`JobStatus::Active`].
    pub fn bind(&mut self, local_id: u64, gid: String) {
        if let Some(job) = self.jobs.get_mut(&local_id) {
            job.remote_id = Some(gid.clone());
            job.status = JobStatus::Active;
            self.outstanding.insert(gid, local_id);
        }
    }

    /// Removes `gid` from the outstanding set, returning the job it belonged to.
    pub fn claim(&mut self, gid: &str) -> Option<u64> {
        self.outstanding.remove(gid)
    }

    pub fn is_outstanding(&self, gid: &str) -> bool {
        self.outstanding.contains_key(gid)
    }

    pub fn outstanding_len(&self) -> usize {
        self.outstanding.len()
    }

    /// True once at least one job was submitted and every job reached a terminal state.
    pub fn is_drained(&self) -> bool {
        self.submitted && self.jobs.values().all(|job| job.status.is_terminal())
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.jobs.values().filter(|job| job.status == status).count()
    }

    pub fn jobs(&self) -> impl Iterator<Item = &DownloadJob> {
        self.jobs.values()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    pub completed: usize,
    pub total: usize,
    /// Bytes per second, as last reported by the daemon.
    pub last_throughput: Option<u64>,
}

impl ProgressState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            ..Default::default()
        }
    }

    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    pub fn throughput_mb(&self) -> Option<f64> {
        self.last_throughput
            .map(|speed| speed as f64 / 1024.0 / 1024.0)
    }
}
