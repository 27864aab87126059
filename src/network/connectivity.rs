use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;
use tokio::sync::watch;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use super::client::endpoint_url;
use super::NetworkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl From<bool> for ConnectivityState {
    fn from(online: bool) -> Self {
        if online {
            ConnectivityState::Online
        } else {
            ConnectivityState::Offline
        }
    }
}

/// Source of raw reachability readings.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    async fn probe(&self) -> bool;
}

/// Probes the backend's `GET /health` endpoint.
pub struct HttpProbe {
    http: reqwest::Client,
    url: Url,
}

impl HttpProbe {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, NetworkError> {
        let url = endpoint_url(base_url, "health")?;
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()?;
        Ok(Self { http, url })
    }

    pub async fn check_once(&self) -> bool {
        match self.http.get(self.url.clone()).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpProbe {
    async fn probe(&self) -> bool {
        self.check_once().await
    }
}

type ChangeCallback = Arc<dyn Fn(bool) + Send + Sync>;

struct MonitorInner {
    contrary_readings: u32,
    callbacks: Vec<ChangeCallback>,
}

/// Best-effort online/offline signal.
///
/// Raw readings come from `report` (the host runtime or the probe loop in
/// `run`). A transition is committed only after `flap_threshold` consecutive
/// readings disagree with the current state, and each committed transition
/// is delivered once to every callback and watch receiver.
///
/// Being online here does not mean the server will answer; callers still
/// handle submission failures.
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
    inner: Mutex<MonitorInner>,
    flap_threshold: u32,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool, flap_threshold: u32) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self {
            state,
            inner: Mutex::new(MonitorInner {
                contrary_readings: 0,
                callbacks: Vec::new(),
            }),
            flap_threshold: flap_threshold.max(1),
        }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    pub fn state(&self) -> ConnectivityState {
        self.is_online().into()
    }

    /// Register a callback invoked with the new value on every transition.
    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        if let Ok(mut inner) = self.inner.lock() {
            inner.callbacks.push(Arc::new(callback));
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Feed one raw reachability reading. Returns true if it committed a
    /// transition.
    pub fn report(&self, reachable: bool) -> bool {
        let callbacks = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(poisoned) => poisoned.into_inner(),
            };

            if reachable == *self.state.borrow() {
                inner.contrary_readings = 0;
                return false;
            }

            inner.contrary_readings += 1;
            if inner.contrary_readings < self.flap_threshold {
                return false;
            }

            inner.contrary_readings = 0;
            self.state.send_replace(reachable);
            inner.callbacks.clone()
        };

        if reachable {
            log::info!("Connectivity restored");
        } else {
            log::warn!("Connectivity lost");
        }

        for callback in callbacks {
            callback(reachable);
        }
        true
    }

    /// Poll `probe` every `interval` until `shutdown` fires.
    pub async fn run(
        self: Arc<Self>,
        probe: Arc<dyn ReachabilityProbe>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            let reachable = tokio::select! {
                _ = shutdown.cancelled() => break,
                ok = probe.probe() => ok,
            };
            self.report(reachable);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(interval) => {}
            }
        }
        log::debug!("Connectivity monitor stopped");
    }
}
