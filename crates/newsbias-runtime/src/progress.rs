//! Progress manager — per-article job registry with fan-out.
//!
//! A non-terminal registry entry doubles as the per-article exclusivity lock:
//! [`ProgressManager::start`] refuses a second job while one is running.
//! Publishing and subscribing both happen under the registry lock, so a new
//! subscriber gets the latest event as a replay and every later event live,
//! with nothing lost or duplicated in between.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures::Stream;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use newsbias_core::{Error, Result};

use crate::types::{JobSnapshot, JobState, ProgressEvent, ProgressStatus};

/// Events buffered per job for slow subscribers. Older ones are dropped first.
const CHANNEL_CAPACITY: usize = 64;

pub type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

struct JobEntry {
    generation: u64,
    request_id: String,
    state: JobState,
    started_at: i64,
    finished_at: Option<i64>,
    finished: Option<Instant>,
    last_event: Option<ProgressEvent>,
    tx: broadcast::Sender<ProgressEvent>,
}

impl JobEntry {
    fn snapshot(&self, article_id: i64) -> JobSnapshot {
        JobSnapshot {
            article_id,
            state: self.state,
            request_id: self.request_id.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_event: self.last_event.clone(),
        }
    }
}

/// Registry of analysis jobs keyed by article ID.
pub struct ProgressManager {
    jobs: Mutex<HashMap<i64, JobEntry>>,
    next_generation: Mutex<u64>,
    cleanup_interval: Duration,
    retention: Duration,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProgressManager {
    pub fn new(cleanup_interval: Duration, retention: Duration) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            jobs: Mutex::new(HashMap::new()),
            next_generation: Mutex::new(0),
            cleanup_interval,
            retention,
            stopped: AtomicBool::new(false),
            shutdown,
            cleanup_task: Mutex::new(None),
        }
    }

    /// Register a job for `article_id` and hand back its writer.
    ///
    /// Fails with [`Error::JobAlreadyRunning`] while a non-terminal job exists.
    /// A finished job still held for late subscribers is replaced.
    pub fn start(self: &Arc<Self>, article_id: i64) -> Result<ProgressWriter> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(Error::Internal("progress manager stopped".into()));
        }

        let mut jobs = self.jobs.lock();
        if let Some(entry) = jobs.get(&article_id) {
            if !entry.state.is_terminal() {
                return Err(Error::JobAlreadyRunning(article_id));
            }
        }

        let generation = {
            let mut next = self.next_generation.lock();
            *next += 1;
            *next
        };
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);

        jobs.insert(
            article_id,
            JobEntry {
                generation,
                request_id: request_id.clone(),
                state: JobState::Queued,
                started_at: chrono::Utc::now().timestamp_millis(),
                finished_at: None,
                finished: None,
                last_event: None,
                tx,
            },
        );

        debug!("Registered job {} for article {}", request_id, article_id);

        Ok(ProgressWriter {
            manager: Arc::clone(self),
            article_id,
            generation,
            request_id,
            last_percent: 0,
            finished: false,
        })
    }

    /// Request ID of the registered job, running or retained.
    pub fn request_id(&self, article_id: i64) -> Option<String> {
        self.jobs
            .lock()
            .get(&article_id)
            .map(|e| e.request_id.clone())
    }

    pub fn is_running(&self, article_id: i64) -> bool {
        self.jobs
            .lock()
            .get(&article_id)
            .map(|e| !e.state.is_terminal())
            .unwrap_or(false)
    }

    /// Attach to the job for `article_id`.
    pub fn subscribe(&self, article_id: i64) -> Subscription {
        let jobs = self.jobs.lock();
        match jobs.get(&article_id) {
            None => Subscription::NoSuchJob,
            Some(entry) => match (&entry.last_event, entry.state.is_terminal()) {
                (Some(ev), true) => Subscription::Finished(ev.clone()),
                (_, true) => Subscription::NoSuchJob,
                (replay, false) => Subscription::Live {
                    replay: replay.clone(),
                    rx: entry.tx.subscribe(),
                },
            },
        }
    }

    /// All registered jobs, oldest first.
    pub fn snapshot(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock();
        let mut out: Vec<JobSnapshot> = jobs.iter().map(|(id, e)| e.snapshot(*id)).collect();
        out.sort_by_key(|s| (s.started_at, s.article_id));
        out
    }

    fn publish(&self, article_id: i64, generation: u64, event: ProgressEvent) {
        let mut jobs = self.jobs.lock();
        let Some(entry) = jobs.get_mut(&article_id) else {
            return;
        };
        if entry.generation != generation || entry.state.is_terminal() {
            return;
        }

        entry.state = match event.status {
            ProgressStatus::InProgress => JobState::Running,
            ProgressStatus::Success => JobState::Succeeded,
            ProgressStatus::Error | ProgressStatus::RateLimited => JobState::Failed,
        };
        if event.is_terminal() {
            entry.finished = Some(Instant::now());
            entry.finished_at = Some(chrono::Utc::now().timestamp_millis());
        }
        entry.last_event = Some(event.clone());
        // No receivers is fine.
        let _ = entry.tx.send(event);
    }

    /// Drop finished jobs older than the retention window. Returns how many.
    pub fn evict_expired(&self) -> usize {
        let mut jobs = self.jobs.lock();
        let before = jobs.len();
        let retention = self.retention;
        jobs.retain(|_, e| match e.finished {
            Some(at) => at.elapsed() < retention,
            None => true,
        });
        before - jobs.len()
    }

    /// Start the background eviction loop. Call once from inside a runtime.
    pub fn spawn_cleanup(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let every = self.cleanup_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(manager) = weak.upgrade() else { break };
                        let evicted = manager.evict_expired();
                        if evicted > 0 {
                            debug!("Evicted {} finished jobs", evicted);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        if let Some(old) = self.cleanup_task.lock().replace(handle) {
            warn!("Progress cleanup was already running; replacing it");
            old.abort();
        }
    }

    /// Halt the eviction loop and drop every job. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.send_replace(true);
        if let Some(handle) = self.cleanup_task.lock().take() {
            handle.abort();
        }
        let dropped = {
            let mut jobs = self.jobs.lock();
            let n = jobs.len();
            jobs.clear();
            n
        };
        info!("Progress manager stopped ({} jobs released)", dropped);
    }
}

// ---------------------------------------------------------------
// Writer
// ---------------------------------------------------------------

/// Exclusive handle for emitting a job's events.
///
/// Percent is clamped so it never decreases. Events after the terminal one
/// are ignored. Dropping the writer without a terminal event emits an
/// `Error`, which releases the article for the next job.
pub struct ProgressWriter {
    manager: Arc<ProgressManager>,
    article_id: i64,
    generation: u64,
    request_id: String,
    last_percent: u8,
    finished: bool,
}

impl ProgressWriter {
    pub fn article_id(&self) -> i64 {
        self.article_id
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn emit(&mut self, mut event: ProgressEvent) {
        if self.finished {
            return;
        }
        event.percent = event.percent.min(100).max(self.last_percent);
        self.last_percent = event.percent;
        self.finished = event.is_terminal();
        self.manager.publish(self.article_id, self.generation, event);
    }

    pub fn progress(&mut self, step: &str, message: impl Into<String>, percent: u8) {
        self.emit(ProgressEvent::in_progress(step, message, percent));
    }

    /// Emit the terminal event and release the job.
    pub fn finish(mut self, event: ProgressEvent) {
        debug_assert!(event.is_terminal());
        self.emit(event);
    }
}

impl Drop for ProgressWriter {
    fn drop(&mut self) {
        if !self.finished {
            warn!("Job for article {} ended without a result", self.article_id);
            self.emit(ProgressEvent::error("Analysis aborted", None));
        }
    }
}

// ---------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------

/// What a subscriber gets when attaching to an article's job.
pub enum Subscription {
    /// Job is running: latest event (if any) then the live tail.
    Live {
        replay: Option<ProgressEvent>,
        rx: broadcast::Receiver<ProgressEvent>,
    },
    /// Job already ended; its terminal event is still retained.
    Finished(ProgressEvent),
    /// Nothing registered for this article.
    NoSuchJob,
}

impl Subscription {
    /// Events up to and including the terminal one. Empty for `NoSuchJob`.
    pub fn into_stream(self) -> EventStream {
        Box::pin(async_stream::stream! {
            match self {
                Subscription::Live { replay, mut rx } => {
                    if let Some(ev) = replay {
                        let terminal = ev.is_terminal();
                        yield ev;
                        if terminal {
                            return;
                        }
                    }
                    loop {
                        match rx.recv().await {
                            Ok(ev) => {
                                let terminal = ev.is_terminal();
                                yield ev;
                                if terminal {
                                    break;
                                }
                            }
                            // The terminal event is always the newest, so it survives lag.
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                debug!("Subscriber lagged, skipped {} events", skipped);
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
                Subscription::Finished(ev) => yield ev,
                Subscription::NoSuchJob => {}
            }
        })
    }

    /// Wait for the job's terminal event. `None` if there is no job or the
    /// registry was stopped first.
    pub async fn wait_terminal(self) -> Option<ProgressEvent> {
        use futures::StreamExt;

        let mut stream = self.into_stream();
        let mut last = None;
        while let Some(ev) = stream.next().await {
            last = Some(ev);
        }
        last.filter(|ev| ev.is_terminal())
    }
}
