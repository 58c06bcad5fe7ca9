//! Connectivity monitor: tracks online/offline state, announces transitions
//! and kicks the sync processor when the link comes back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::clock::Clock;

/// Emitted once per state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  Online,
  Offline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
  pub is_online: bool,
  pub last_transition: DateTime<Utc>,
}

/// Something that can start draining pending work. Implemented by the sync processor.
pub trait DrainTrigger: Send + Sync {
  fn trigger_drain(&self);
}

/// Platform reachability signal.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
  async fn is_reachable(&self) -> bool;
}

const EVENT_CAPACITY: usize = 64;

pub struct ConnectivityMonitor {
  state: Mutex<ConnectivityState>,
  events: broadcast::Sender<ConnectivityEvent>,
  drain: Mutex<Option<Weak<dyn DrainTrigger>>>,
  clock: Arc<dyn Clock>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool, clock: Arc<dyn Clock>) -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      state: Mutex::new(ConnectivityState {
        is_online: initially_online,
        last_transition: clock.now(),
      }),
      events,
      drain: Mutex::new(None),
      clock,
    }
  }

  pub fn is_online(&self) -> bool {
    self.state().is_online
  }

  pub fn state(&self) -> ConnectivityState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.events.subscribe()
  }

  /// Register what to call when connectivity returns.
  pub fn set_drain_trigger(&self, trigger: Weak<dyn DrainTrigger>) {
    *self.drain.lock().unwrap_or_else(|e| e.into_inner()) = Some(trigger);
  }

  /// Feed a reachability observation. Returns true if it changed the state.
  ///
  /// Repeated observations of the same state are ignored.
  pub fn set_online(&self, online: bool) -> bool {
    {
      let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
      if state.is_online == online {
        return false;
      }
      state.is_online = online;
      state.last_transition = self.clock.now();
    }

    let event = if online {
      ConnectivityEvent::Online
    } else {
      ConnectivityEvent::Offline
    };
    info!(?event, "connectivity changed");
    // No subscribers is fine
    let _ = self.events.send(event);

    if online {
      let trigger = self
        .drain
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .as_ref()
        .and_then(Weak::upgrade);
      if let Some(trigger) = trigger {
        trigger.trigger_drain();
      }
    }
    true
  }

  /// Poll `probe` every `interval` and feed the results into the monitor.
  ///
  /// The task stops on its own once the monitor is dropped.
  pub fn spawn_probe(
    self: &Arc<Self>,
    probe: Arc<dyn ReachabilityProbe>,
    interval: Duration,
  ) -> JoinHandle<()> {
    let monitor = Arc::downgrade(self);
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      loop {
        ticker.tick().await;
        let reachable = probe.is_reachable().await;
        match monitor.upgrade() {
          Some(monitor) => {
            debug!(reachable, "connectivity probe");
            monitor.set_online(reachable);
          }
          None => break,
        }
      }
    })
  }
}
