//! Sync processor: drains the queue against the remote service.
//!
//! Jobs run one at a time in submission order. A failing job is retried in
//! place after an exponential backoff until it succeeds or spends its retry
//! budget, so later jobs never overtake it.

use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex, MutexGuard};
use tracing::{debug, error, info, warn};

use super::job::{FailedJob, RetryDecision, SyncJob, SyncJobInput};
use super::queue::SyncQueue;
use crate::clock::Clock;
use crate::connectivity::{ConnectivityMonitor, DrainTrigger};
use crate::error::{QueuePersistError, RemoteError, RemoteResult};
use crate::remote::RemoteDataService;

/// Retry and timeout knobs for the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSettings {
  pub max_retries: u32,
  pub retry_base_delay: Duration,
  pub retry_max_delay: Duration,
  /// Upper bound on a single remote call
  pub call_timeout: Duration,
}

impl Default for SyncSettings {
  fn default() -> Self {
    Self {
      max_retries: 3,
      retry_base_delay: Duration::from_millis(500),
      retry_max_delay: Duration::from_secs(30),
      call_timeout: Duration::from_secs(30),
    }
  }
}

/// Totals for one drain run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub succeeded: usize,
  /// Failed attempts that were scheduled for another try
  pub retried: usize,
  pub dropped: usize,
  /// Jobs still queued when the drain stopped
  pub remaining: usize,
  /// The drain stopped early because connectivity was lost
  pub paused: bool,
}

/// Notifications published while draining.
#[derive(Debug, Clone)]
pub enum SyncEvent {
  DrainStarted { pending: usize },
  JobSucceeded { id: String },
  RetryScheduled {
    id: String,
    attempt: u32,
    delay: Duration,
    error: String,
  },
  /// Retry budget exhausted; the job left the queue for good
  JobDropped(FailedJob),
  DrainFinished(DrainReport),
}

const EVENT_CAPACITY: usize = 256;

/// Delay before retry number `attempt` (1-based): doubles from `base`, capped
/// at `max`, with the upper half randomized.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
  let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
  let capped = base.saturating_mul(factor).min(max);
  let half = capped / 2;
  let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
  (capped - half + Duration::from_millis(jitter_ms)).min(capped)
}

pub struct SyncProcessor {
  queue: Arc<SyncQueue>,
  remote: Arc<dyn RemoteDataService>,
  connectivity: Arc<ConnectivityMonitor>,
  settings: SyncSettings,
  clock: Arc<dyn Clock>,
  events: broadcast::Sender<SyncEvent>,
  drain_lock: AsyncMutex<()>,
  rerun_requested: AtomicBool,
  this: Weak<SyncProcessor>,
}

impl SyncProcessor {
  /// Build the processor and register it as the monitor's drain trigger.
  pub fn new(
    queue: Arc<SyncQueue>,
    remote: Arc<dyn RemoteDataService>,
    connectivity: Arc<ConnectivityMonitor>,
    settings: SyncSettings,
    clock: Arc<dyn Clock>,
  ) -> Arc<Self> {
    let processor = Arc::new_cyclic(|this: &Weak<SyncProcessor>| {
      let (events, _) = broadcast::channel(EVENT_CAPACITY);
      Self {
        queue,
        remote,
        connectivity,
        settings,
        clock,
        events,
        drain_lock: AsyncMutex::new(()),
        rerun_requested: AtomicBool::new(false),
        this: this.clone(),
      }
    });
    let trigger: Weak<dyn DrainTrigger> = processor.this.clone();
    processor.connectivity.set_drain_trigger(trigger);
    processor
  }

  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn queue(&self) -> &Arc<SyncQueue> {
    &self.queue
  }

  fn emit(&self, event: SyncEvent) {
    // No subscribers is fine
    let _ = self.events.send(event);
  }

  /// Queue a mutation and, when online, start draining right away.
  ///
  /// A persist failure is reported, but the job is still attempted for the
  /// lifetime of this process.
  pub fn enqueue(&self, input: SyncJobInput) -> Result<String, QueuePersistError> {
    let job = SyncJob::new(input, self.settings.max_retries, self.clock.now());
    let id = job.id.clone();
    debug!(id = %id, job_type = ?job.job_type, "enqueued sync job");
    let persisted = self.queue.push(job);

    if self.connectivity.is_online() {
      self.trigger_drain();
    }

    match persisted {
      Ok(()) => Ok(id),
      Err(source) => {
        warn!(id = %id, error = %source, "sync job kept in memory only");
        Err(QueuePersistError { job_id: id, source })
      }
    }
  }

  async fn attempt(&self, job: &SyncJob) -> RemoteResult<()> {
    let timeout = self.settings.call_timeout;
    tokio::time::timeout(timeout, self.remote.apply_mutation(job))
      .await
      .map_err(|_| RemoteError::Timeout(timeout))?
  }

  /// Run queued jobs until the queue is empty or connectivity drops.
  ///
  /// Returns `None` when another drain is already running; the running drain
  /// then makes one more pass before it finishes.
  pub async fn drain(&self) -> Option<DrainReport> {
    let mut guard = match self.drain_lock.try_lock() {
      Ok(guard) => guard,
      Err(_) => {
        self.rerun_requested.store(true, Ordering::SeqCst);
        // The running drain may have released the lock since the first try
        match self.drain_lock.try_lock() {
          Ok(guard) => guard,
          Err(_) => {
            debug!("drain already running, coalescing");
            return None;
          }
        }
      }
    };

    self.emit(SyncEvent::DrainStarted {
      pending: self.queue.len(),
    });
    info!(pending = self.queue.len(), "sync drain started");

    let mut report = DrainReport::default();
    loop {
      self.rerun_requested.store(false, Ordering::SeqCst);
      self.drain_pass(&mut report).await;
      if report.paused {
        break;
      }
      if self.rerun_requested.load(Ordering::SeqCst) {
        continue;
      }
      match self.release(guard) {
        Some(reacquired) => guard = reacquired,
        None => break,
      }
    }
    report.remaining = self.queue.len();

    info!(
      succeeded = report.succeeded,
      retried = report.retried,
      dropped = report.dropped,
      remaining = report.remaining,
      paused = report.paused,
      "sync drain finished"
    );
    self.emit(SyncEvent::DrainFinished(report));
    Some(report)
  }

  /// Give up the drain lock. If a trigger was turned away while it was held
  /// and jobs are pending, take it back so that work is not stranded.
  fn release<'a>(&'a self, guard: MutexGuard<'a, ()>) -> Option<MutexGuard<'a, ()>> {
    drop(guard);
    if self.rerun_requested.load(Ordering::SeqCst) && !self.queue.is_empty() {
      self.drain_lock.try_lock().ok()
    } else {
      None
    }
  }

  async fn drain_pass(&self, report: &mut DrainReport) {
    while let Some(mut job) = self.queue.front() {
      if !self.connectivity.is_online() {
        info!("offline, pausing sync drain");
        report.paused = true;
        return;
      }

      let error = match self.attempt(&job).await {
        Ok(()) => {
          if let Err(e) = self.queue.remove(&job.id) {
            warn!(id = %job.id, error = %e, "failed to persist completed sync job");
          }
          debug!(id = %job.id, "sync job applied");
          report.succeeded += 1;
          self.emit(SyncEvent::JobSucceeded { id: job.id });
          continue;
        }
        Err(e) => e.to_string(),
      };

      match job.record_failure(error.clone()) {
        RetryDecision::Retry => {
          if let Err(e) = self.queue.update(&job) {
            warn!(id = %job.id, error = %e, "failed to persist sync job retry count");
          }
          let delay = backoff_delay(
            job.retries,
            self.settings.retry_base_delay,
            self.settings.retry_max_delay,
          );
          warn!(
            id = %job.id,
            attempt = job.retries,
            max_retries = job.max_retries,
            ?delay,
            error = %error,
            "sync job failed, retrying"
          );
          report.retried += 1;
          self.emit(SyncEvent::RetryScheduled {
            id: job.id.clone(),
            attempt: job.retries,
            delay,
            error,
          });
          tokio::time::sleep(delay).await;
        }
        RetryDecision::Drop => {
          let (failed, persisted) = self.queue.drop_job(job, error, self.clock.now());
          if let Err(e) = persisted {
            warn!(id = %failed.job.id, error = %e, "failed to persist dropped sync job");
          }
          error!(
            id = %failed.job.id,
            retries = failed.job.retries,
            error = %failed.error,
            "sync job permanently failed"
          );
          report.dropped += 1;
          self.emit(SyncEvent::JobDropped(failed));
        }
      }
    }
  }
}

impl DrainTrigger for SyncProcessor {
  fn trigger_drain(&self) {
    let Some(this) = self.this.upgrade() else {
      return;
    };
    match tokio::runtime::Handle::try_current() {
      Ok(handle) => {
        handle.spawn(async move {
          this.drain().await;
        });
      }
      Err(_) => debug!("no runtime available, drain deferred"),
    }
  }
}
