//! Debounced online/offline tracking.

use async_trait::async_trait;
use reqwest::Client;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::error::{Error, Result};

/// A committed connectivity transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityEvent {
  BecameOnline,
  WentOffline,
}

/// Source of raw reachability observations.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync + 'static {
  async fn probe(&self) -> bool;
}

/// Reachable means the server answered a `HEAD` request at all, whatever the
/// status.
pub struct HttpProbe {
  client: Client,
  url: Url,
  timeout: Duration,
}

impl HttpProbe {
  pub fn new(url: &str, timeout: Duration) -> Result<Self> {
    let url =
      Url::parse(url).map_err(|e| Error::Config(format!("Invalid probe url {}: {}", url, e)))?;
    let client = Client::builder()
      .build()
      .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;
    Ok(Self {
      client,
      url,
      timeout,
    })
  }
}

#[async_trait]
impl ConnectivityProbe for HttpProbe {
  async fn probe(&self) -> bool {
    match self
      .client
      .head(self.url.clone())
      .timeout(self.timeout)
      .send()
      .await
    {
      Ok(_) => true,
      Err(e) => {
        debug!(url = %self.url, error = %e, "Connectivity probe failed");
        false
      }
    }
  }
}

#[derive(Default)]
struct Pending {
  generation: u64,
  target: Option<bool>,
}

struct Inner {
  online: watch::Sender<bool>,
  events: broadcast::Sender<ConnectivityEvent>,
  debounce: Duration,
  pending: Mutex<Pending>,
}

/// Tracks whether the remote is reachable.
///
/// Raw observations go through [`report`](Self::report). A change is only
/// committed once it has held for the debounce window; an observation that
/// reverts to the committed value within the window cancels the flip.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  inner: Arc<Inner>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool, debounce: Duration) -> Self {
    let (online, _) = watch::channel(initially_online);
    let (events, _) = broadcast::channel(16);
    Self {
      inner: Arc::new(Inner {
        online,
        events,
        debounce,
        pending: Mutex::new(Pending::default()),
      }),
    }
  }

  /// Create a monitor initialised from one probe.
  pub async fn start(probe: &dyn ConnectivityProbe, debounce: Duration) -> Self {
    let online = probe.probe().await;
    info!(online, "Initial connectivity");
    Self::new(online, debounce)
  }

  pub fn is_online(&self) -> bool {
    *self.inner.online.borrow()
  }

  /// Receiver of the committed state.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.inner.online.subscribe()
  }

  /// Receiver of committed transitions.
  pub fn subscribe(&self) -> broadcast::Receiver<ConnectivityEvent> {
    self.inner.events.subscribe()
  }

  /// Feed one raw observation.
  pub fn report(&self, online: bool) {
    let generation = {
      let mut pending = self.lock_pending();
      if online == self.is_online() {
        if pending.target.take().is_some() {
          pending.generation += 1;
          debug!(online, "Connectivity change reverted within debounce window");
        }
        return;
      }
      if pending.target == Some(online) {
        return;
      }
      pending.generation += 1;
      pending.target = Some(online);
      pending.generation
    };

    if self.inner.debounce.is_zero() {
      self.commit(generation);
      return;
    }

    let monitor = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(monitor.inner.debounce).await;
      monitor.commit(generation);
    });
  }

  /// Probe every `interval` and report the result until `cancel` fires.
  pub fn spawn_polling<P: ConnectivityProbe>(
    &self,
    probe: Arc<P>,
    interval: Duration,
    cancel: CancellationToken,
  ) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
      loop {
        tokio::select! {
          _ = cancel.cancelled() => break,
          _ = ticker.tick() => {
            let online = tokio::select! {
              _ = cancel.cancelled() => break,
              online = probe.probe() => online,
            };
            monitor.report(online);
          }
        }
      }
      debug!("Connectivity polling stopped");
    })
  }

  fn commit(&self, generation: u64) {
    let mut pending = self.lock_pending();
    if pending.generation != generation {
      return;
    }
    let Some(online) = pending.target.take() else {
      return;
    };

    self.inner.online.send_replace(online);
    let event = if online {
      ConnectivityEvent::BecameOnline
    } else {
      ConnectivityEvent::WentOffline
    };
    info!(?event, "Connectivity changed");
    let _ = self.inner.events.send(event);
  }

  fn lock_pending(&self) -> MutexGuard<'_, Pending> {
    self.inner.pending.lock().unwrap_or_else(|e| e.into_inner())
  }
}
