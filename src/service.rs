//! VPN watcher service and lifecycle
//!
//! [`VpnWatcher`] ties the pieces together:
//!
//! ```text
//! OS signal ──▶ ChangeMonitor ──▶ event queue ──▶ Detector ──▶ Broadcaster ──▶ StateStream(s)
//! ```
//!
//! The monitor only runs while at least one [`StateStream`] is alive. The
//! first stream starts it (which also queues an immediate recheck); dropping
//! the last one stops it. All detection results are processed sequentially
//! by a single task, so state transitions are published in trigger order.
//!
//! One-shot queries (`is_vpn_active`, `get_vpn_info`) call the detector
//! directly and keep working after [`VpnWatcher::dispose`].

use crate::broadcast::Broadcaster;
use crate::classifier::InterfaceClassifier;
use crate::config::Config;
use crate::detector::Detector;
use crate::error::{Result, WatchError};
use crate::monitor::{
    ActiveMonitor, ChangeMonitor, EventSource, PollingSource, PushSource, TriggerReceiver,
};
use crate::platform::{PlatformProbe, SystemProbe};
use crate::state::{ConnectionState, TunnelInfo};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// Process-wide instance, created on first access and released by dispose_shared
lazy_static::lazy_static! {
    static ref SHARED: Mutex<Option<VpnWatcher>> = Mutex::new(None);
}

/// Monitor and event loop, alive while anyone subscribes
struct ActiveSession {
    monitor: ActiveMonitor,
    worker: JoinHandle<()>,
}

impl ActiveSession {
    fn stop(self) {
        drop(self.monitor);
        self.worker.abort();
    }
}

#[derive(Default)]
struct Session {
    subscribers: usize,
    active: Option<ActiveSession>,
    disposed: bool,
}

struct Inner {
    config: Config,
    detector: Arc<Detector>,
    monitor: ChangeMonitor,
    push: PushSource,
    broadcaster: Arc<Broadcaster>,
    session: Mutex<Session>,
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a subscriber, starting the monitor for the first one
    fn acquire(self: &Arc<Self>) -> Result<StateStream> {
        let mut session = self.session();
        if session.disposed {
            return Err(WatchError::InvalidState("watcher has been disposed".to_string()));
        }

        // Subscribe before starting so the activation result is not missed
        let states = self
            .broadcaster
            .subscribe()
            .ok_or_else(|| WatchError::InvalidState("state channel is closed".to_string()))?;

        if session.subscribers == 0 {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| WatchError::InvalidState(format!("No tokio runtime: {e}")))?;
            let (triggers, queue) = mpsc::unbounded_channel();
            let worker = runtime.spawn(run_event_loop(
                Arc::clone(&self.detector),
                Arc::clone(&self.broadcaster),
                queue,
            ));
            let monitor = self.monitor.activate(triggers);
            log::info!(
                "VPN monitoring started with {} source(s)",
                monitor.source_count()
            );
            session.active = Some(ActiveSession { monitor, worker });
        }
        session.subscribers += 1;

        Ok(StateStream {
            states,
            lease: Some(Lease {
                inner: Arc::clone(self),
            }),
        })
    }

    /// Drop a subscriber, stopping the monitor after the last one
    fn release(&self) {
        let mut session = self.session();
        session.subscribers = session.subscribers.saturating_sub(1);
        if session.subscribers > 0 {
            return;
        }
        if let Some(active) = session.active.take() {
            // The cached state survives; the next activation rechecks it
            active.stop();
            log::info!("VPN monitoring stopped, no subscribers left");
        }
    }

    fn dispose(&self) {
        let mut session = self.session();
        if session.disposed {
            return;
        }
        session.disposed = true;
        if let Some(active) = session.active.take() {
            active.stop();
        }
        self.broadcaster.close();
        log::info!("VPN watcher disposed");
    }
}

/// The single logical event queue: one detection per trigger, in order
async fn run_event_loop(
    detector: Arc<Detector>,
    broadcaster: Arc<Broadcaster>,
    mut queue: TriggerReceiver,
) {
    while let Some(reason) = queue.recv().await {
        log::debug!("Rechecking VPN state after {reason}");

        let task_detector = Arc::clone(&detector);
        let active = match tokio::task::spawn_blocking(move || task_detector.detect()).await {
            Ok(active) => active,
            Err(e) => {
                log::warn!("Detection task failed, treating as no VPN: {e}");
                false
            }
        };

        if let Some(state) = broadcaster.publish(active) {
            log::info!("VPN state changed: {state}");
        }
    }
}

/// Keeps the monitor running while held
struct Lease {
    inner: Arc<Inner>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release();
    }
}

/// Live stream of connection state transitions
///
/// Yields the current state promptly after subscribing, then every change.
/// Dropping the stream cancels this subscription only. The stream ends when
/// the watcher is disposed.
pub struct StateStream {
    states: BoxStream<'static, ConnectionState>,
    lease: Option<Lease>,
}

impl StateStream {
    /// Explicitly cancel; equivalent to dropping the stream
    pub fn cancel(mut self) {
        self.lease.take();
    }
}

impl Stream for StateStream {
    type Item = ConnectionState;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.states.poll_next_unpin(cx)
    }
}

impl fmt::Debug for StateStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStream")
            .field("active", &self.lease.is_some())
            .finish()
    }
}

/// VPN presence detector with a live state stream
///
/// Cheap to clone; clones share the same monitor, cache and subscribers.
#[derive(Clone)]
pub struct VpnWatcher {
    inner: Arc<Inner>,
}

impl VpnWatcher {
    pub fn builder() -> VpnWatcherBuilder {
        VpnWatcherBuilder::default()
    }

    /// Watcher for this host with the given configuration
    pub fn new(config: Config) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// The process-wide instance, created with default settings if needed
    pub fn shared() -> VpnWatcher {
        let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
        shared
            .get_or_insert_with(|| {
                log::debug!("Creating shared VPN watcher");
                VpnWatcherBuilder::default().assemble()
            })
            .clone()
    }

    /// Create the process-wide instance with a specific configuration
    ///
    /// Fails if one already exists; call [`VpnWatcher::dispose_shared`] first.
    pub fn init_shared(config: Config) -> Result<VpnWatcher> {
        let watcher = Self::new(config)?;
        let mut shared = SHARED.lock().unwrap_or_else(|e| e.into_inner());
        if shared.is_some() {
            return Err(WatchError::InvalidState(
                "shared watcher already initialized".to_string(),
            ));
        }
        *shared = Some(watcher.clone());
        Ok(watcher)
    }

    /// Dispose and forget the process-wide instance; safe to call repeatedly
    pub fn dispose_shared() {
        let taken = SHARED.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(watcher) = taken {
            watcher.dispose();
        }
    }

    /// One-shot check; blocks only on bounded OS queries
    pub fn is_vpn_active(&self) -> bool {
        self.inner.detector.detect()
    }

    /// One-shot check with interface name and protocol where inferable
    pub fn get_vpn_info(&self) -> TunnelInfo {
        self.inner.detector.detect_info()
    }

    /// Subscribe to connection state transitions
    ///
    /// Must be called within a tokio runtime. Fails after [`VpnWatcher::dispose`].
    pub fn connection_state_stream(&self) -> Result<StateStream> {
        self.inner.acquire()
    }

    /// Last state delivered to subscribers, `None` before the first one
    pub fn current_state(&self) -> Option<ConnectionState> {
        self.inner.broadcaster.current()
    }

    /// Extend the classifier's pattern table; returns whether it changed
    pub fn add_interface_pattern(&self, pattern: &str, protocol: Option<&str>) -> bool {
        self.inner
            .detector
            .classifier()
            .add_pattern(pattern, protocol)
    }

    /// Handle for forwarding host OS notifications into the monitor
    pub fn push_source(&self) -> PushSource {
        self.inner.push.clone()
    }

    /// Stop monitoring and end all streams; idempotent
    pub fn dispose(&self) {
        self.inner.dispose();
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.session().disposed
    }

    /// Whether OS subscriptions are currently held
    pub fn is_monitoring(&self) -> bool {
        self.inner.session().active.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.session().subscribers
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl fmt::Debug for VpnWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let session = self.inner.session();
        f.debug_struct("VpnWatcher")
            .field("detector", &self.inner.detector)
            .field("monitor", &self.inner.monitor)
            .field("subscribers", &session.subscribers)
            .field("disposed", &session.disposed)
            .finish()
    }
}

/// Builder for watchers with custom probes or event sources
#[derive(Default)]
pub struct VpnWatcherBuilder {
    config: Config,
    probe: Option<Arc<dyn PlatformProbe>>,
    sources: Vec<Arc<dyn EventSource>>,
    without_system_sources: bool,
}

impl VpnWatcherBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replace the host probe, e.g. with one backed by native APIs
    pub fn probe(mut self, probe: Arc<dyn PlatformProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Add an extra event source
    pub fn source(mut self, source: Arc<dyn EventSource>) -> Self {
        self.sources.push(source);
        self
    }

    /// Skip interface polling and netlink; only added and pushed events trigger
    pub fn without_system_sources(mut self) -> Self {
        self.without_system_sources = true;
        self
    }

    pub fn build(self) -> Result<VpnWatcher> {
        self.config.validate()?;
        Ok(self.assemble())
    }

    fn assemble(self) -> VpnWatcher {
        let config = self.config;
        let probe = self
            .probe
            .unwrap_or_else(|| Arc::new(SystemProbe::new(config.query_timeout())));
        let classifier = Arc::new(InterfaceClassifier::from_config(&config.detection));
        let detector = Arc::new(Detector::new(
            Arc::clone(&probe),
            classifier,
            &config.detection,
        ));

        let push = PushSource::new();
        let mut monitor = ChangeMonitor::new(self.sources);
        monitor.add_source(Arc::new(push.clone()));
        if !self.without_system_sources {
            monitor.add_source(Arc::new(PollingSource::new(
                Arc::clone(&probe),
                config.poll_interval(),
            )));
            #[cfg(target_os = "linux")]
            if config.monitor.netlink {
                monitor.add_source(Arc::new(crate::monitor::NetlinkSource::new()));
            }
        }

        let broadcaster = Arc::new(Broadcaster::new(config.monitor.broadcast_capacity));

        VpnWatcher {
            inner: Arc::new(Inner {
                config,
                detector,
                monitor,
                push,
                broadcaster,
                session: Mutex::new(Session::default()),
            }),
        }
    }
}
