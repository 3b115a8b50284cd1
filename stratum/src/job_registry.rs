//! Process-wide job registry: the only coupling between the upstream
//! template source and every session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use btcpool_bitcoin::Template;
use tokio::sync::broadcast;

/// A template together with the job id the registry assigned it. Carries no
/// payout information — each session builds its own coinbase against
/// [`JobEntry::template`] using its own payout address, then caches the
/// result locally keyed by `job_id`. The merkle branch depends only on the
/// non-coinbase transactions, so every session's coinbase folds against the
/// same branch regardless of whose address it pays.
#[derive(Debug, Clone)]
pub struct JobEntry {
    pub job_id: u64,
    pub template: Arc<Template>,
    pub clean_jobs: bool,
}

const DEFAULT_CHANNEL_CAPACITY: usize = 16;
const MAX_LIVE_JOBS: usize = 4;

struct Inner {
    next_job_id: u64,
    jobs_by_id: HashMap<u64, Arc<JobEntry>>,
    current_entry: Option<Arc<JobEntry>>,
}

/// Builds [`JobEntry`]s from upstream templates and fans them out to every
/// subscribed session over a bounded, latest-wins broadcast channel.
pub struct JobRegistry {
    inner: Mutex<Inner>,
    sender: broadcast::Sender<Arc<JobEntry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        let (sender, _receiver) = broadcast::channel(DEFAULT_CHANNEL_CAPACITY);
        Self {
            inner: Mutex::new(Inner { next_job_id: 1, jobs_by_id: HashMap::new(), current_entry: None }),
            sender,
        }
    }

    /// Allocates a fresh monotonic job id.
    fn next_id(&self, inner: &mut Inner) -> u64 {
        let id = inner.next_job_id;
        inner.next_job_id = inner.next_job_id.wrapping_add(1);
        id
    }

    /// Admits a new upstream template. If `template.is_new_tip`, prior jobs
    /// become unreferenceable (a late submission against them then fails
    /// with `JobNotFound`). Publishes the resulting [`JobEntry`] on the
    /// broadcast channel; slow subscribers see only the latest entry.
    pub fn on_new_template(&self, template: Template) -> Arc<JobEntry> {
        let template = Arc::new(template);
        let mut inner = self.inner.lock().unwrap();
        let job_id = self.next_id(&mut inner);
        let clean_jobs = template.is_new_tip;

        if clean_jobs {
            inner.jobs_by_id.clear();
        } else if inner.jobs_by_id.len() >= MAX_LIVE_JOBS {
            // bound the map even without a tip change: drop the oldest id.
            if let Some(&oldest) = inner.jobs_by_id.keys().min() {
                inner.jobs_by_id.remove(&oldest);
            }
        }

        let entry = Arc::new(JobEntry { job_id, template: template.clone(), clean_jobs });
        inner.jobs_by_id.insert(job_id, entry.clone());
        inner.current_entry = Some(entry.clone());

        // A lagging receiver only means a session missed an intermediate
        // job; it will be caught up by whatever publishes next.
        let _ = self.sender.send(entry.clone());
        entry
    }

    pub fn get_job(&self, id: u64) -> Option<Arc<JobEntry>> {
        self.inner.lock().unwrap().jobs_by_id.get(&id).cloned()
    }

    pub fn current_template(&self) -> Option<Arc<Template>> {
        self.inner.lock().unwrap().current_entry.as_ref().map(|e| e.template.clone())
    }

    /// The most recently published entry, for a session that needs to force
    /// a `clean_jobs=true` re-push of the current job (e.g. after a vardiff
    /// change) without waiting for the next upstream template.
    pub fn current_entry(&self) -> Option<Arc<JobEntry>> {
        self.inner.lock().unwrap().current_entry.clone()
    }

    /// Yields a receive handle that observes every subsequent [`JobEntry`].
    /// A slow subscriber sees only the latest job on overflow — it never
    /// observes an older job after a newer one.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<JobEntry>> {
        self.sender.subscribe()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
