//! Change monitor
//!
//! Turns OS network notifications into "recheck now" triggers. It never
//! decides VPN state itself. Sources are only started while someone is
//! listening; [`ChangeMonitor::activate`] starts all of them and sends one
//! synthetic trigger so the initial state is computed without waiting for a
//! real event. Dropping the returned [`ActiveMonitor`] cancels every source.

use crate::error::{Result, WatchError};
use crate::platform::{NetworkInterface, PlatformProbe};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Why a recheck was requested; used for logging only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TriggerReason {
    /// Synthetic trigger sent when the monitor starts
    Activation,
    /// Generic connectivity change
    Connectivity,
    /// Network path / interface set changed
    PathUpdate,
    /// Dedicated VPN status notification
    VpnStatus,
}

impl fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerReason::Activation => f.write_str("activation"),
            TriggerReason::Connectivity => f.write_str("connectivity change"),
            TriggerReason::PathUpdate => f.write_str("path update"),
            TriggerReason::VpnStatus => f.write_str("VPN status change"),
        }
    }
}

/// Sending half of the single event queue
pub type TriggerSender = mpsc::UnboundedSender<TriggerReason>;
/// Receiving half of the single event queue
pub type TriggerReceiver = mpsc::UnboundedReceiver<TriggerReason>;

/// Cancels an underlying OS subscription when dropped
pub struct SourceGuard {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl SourceGuard {
    pub fn new<F: FnOnce() + Send + 'static>(cancel: F) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    /// Guard for a source with nothing to release
    pub fn noop() -> Self {
        Self { cancel: None }
    }
}

impl Drop for SourceGuard {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

/// A push-style notification source
pub trait EventSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Subscribe to the OS; every notification becomes a trigger on `triggers`
    fn start(&self, triggers: TriggerSender) -> Result<SourceGuard>;
}

/// Running set of subscriptions; dropping it unsubscribes everything
pub struct ActiveMonitor {
    guards: Vec<(&'static str, SourceGuard)>,
}

impl ActiveMonitor {
    pub fn source_count(&self) -> usize {
        self.guards.len()
    }
}

impl Drop for ActiveMonitor {
    fn drop(&mut self) {
        for (name, guard) in self.guards.drain(..) {
            drop(guard);
            log::debug!("Stopped {name} source");
        }
    }
}

/// The set of sources shared by every subscriber
#[derive(Default)]
pub struct ChangeMonitor {
    sources: Vec<Arc<dyn EventSource>>,
}

impl ChangeMonitor {
    pub fn new(sources: Vec<Arc<dyn EventSource>>) -> Self {
        Self { sources }
    }

    pub fn add_source(&mut self, source: Arc<dyn EventSource>) {
        self.sources.push(source);
    }

    pub fn source_names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Start every source and queue the initial synthetic trigger
    ///
    /// A source that fails to start is logged and skipped; the others keep
    /// running.
    pub fn activate(&self, triggers: TriggerSender) -> ActiveMonitor {
        let _ = triggers.send(TriggerReason::Activation);

        let mut guards = Vec::with_capacity(self.sources.len());
        for source in &self.sources {
            match source.start(triggers.clone()) {
                Ok(guard) => {
                    log::debug!("Started {} source", source.name());
                    guards.push((source.name(), guard));
                }
                Err(e) => log::warn!("Failed to start {} source: {e}", source.name()),
            }
        }

        ActiveMonitor { guards }
    }
}

impl fmt::Debug for ChangeMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeMonitor")
            .field("sources", &self.source_names())
            .finish()
    }
}

/// Periodic interface snapshot; triggers when the (name, up) set changes
pub struct PollingSource {
    probe: Arc<dyn PlatformProbe>,
    interval: Duration,
}

impl PollingSource {
    pub fn new(probe: Arc<dyn PlatformProbe>, interval: Duration) -> Self {
        Self { probe, interval }
    }
}

impl EventSource for PollingSource {
    fn name(&self) -> &'static str {
        "interface polling"
    }

    fn start(&self, triggers: TriggerSender) -> Result<SourceGuard> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| WatchError::InvalidState(format!("No tokio runtime: {e}")))?;
        let probe = Arc::clone(&self.probe);
        let interval = self.interval;

        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut previous: Option<Vec<NetworkInterface>> = None;

            loop {
                ticker.tick().await;
                let probe = Arc::clone(&probe);
                let snapshot = tokio::task::spawn_blocking(move || snapshot(probe.as_ref()))
                    .await
                    .unwrap_or_default();

                if previous.as_ref().is_some_and(|p| *p != snapshot) {
                    log::debug!("Interface set changed");
                    if triggers.send(TriggerReason::PathUpdate).is_err() {
                        break;
                    }
                }
                previous = Some(snapshot);
            }
        });

        Ok(SourceGuard::new(move || task.abort()))
    }
}

fn snapshot(probe: &dyn PlatformProbe) -> Vec<NetworkInterface> {
    match probe.interfaces() {
        Ok(mut interfaces) => {
            interfaces.sort_by(|a, b| a.name.cmp(&b.name));
            interfaces
        }
        Err(e) => {
            log::debug!("Interface snapshot failed: {e}");
            Vec::new()
        }
    }
}

/// Handle through which a host binding forwards its own OS callbacks
///
/// Cloneable and callable from any thread. Notifications are queued onto the
/// event queue while the monitor is active and dropped otherwise.
#[derive(Clone, Default)]
pub struct PushSource {
    target: Arc<Mutex<Option<TriggerSender>>>,
}

impl PushSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_connectivity(&self) -> bool {
        self.notify(TriggerReason::Connectivity)
    }

    pub fn notify_path_update(&self) -> bool {
        self.notify(TriggerReason::PathUpdate)
    }

    pub fn notify_vpn_status(&self) -> bool {
        self.notify(TriggerReason::VpnStatus)
    }

    /// Queue a trigger; returns whether anyone was listening
    pub fn notify(&self, reason: TriggerReason) -> bool {
        let target = self.target.lock().unwrap_or_else(|e| e.into_inner());
        match target.as_ref() {
            Some(sender) => sender.send(reason).is_ok(),
            None => false,
        }
    }

    pub fn is_listening(&self) -> bool {
        self.target
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl EventSource for PushSource {
    fn name(&self) -> &'static str {
        "host push"
    }

    fn start(&self, triggers: TriggerSender) -> Result<SourceGuard> {
        *self.target.lock().unwrap_or_else(|e| e.into_inner()) = Some(triggers);

        let target = Arc::clone(&self.target);
        Ok(SourceGuard::new(move || {
            *target.lock().unwrap_or_else(|e| e.into_inner()) = None;
        }))
    }
}

#[cfg(target_os = "linux")]
pub use netlink::NetlinkSource;

#[cfg(target_os = "linux")]
mod netlink {
    use super::{EventSource, SourceGuard, TriggerReason, TriggerSender};
    use crate::error::Result;
    use std::io;
    use std::mem;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    /// rtnetlink link and address notifications
    #[derive(Debug, Default)]
    pub struct NetlinkSource;

    impl NetlinkSource {
        pub fn new() -> Self {
            Self
        }

        fn open() -> io::Result<OwnedFd> {
            // SAFETY: plain socket(2) call; the result is checked before use.
            let raw = unsafe {
                libc::socket(
                    libc::AF_NETLINK,
                    libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                    libc::NETLINK_ROUTE,
                )
            };
            if raw < 0 {
                return Err(io::Error::last_os_error());
            }
            // SAFETY: `raw` is a freshly created descriptor owned by nobody else.
            let socket = unsafe { OwnedFd::from_raw_fd(raw) };

            // SAFETY: sockaddr_nl is plain old data; all-zero is a valid value.
            let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
            addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
            addr.nl_groups = (libc::RTMGRP_LINK
                | libc::RTMGRP_IPV4_IFADDR
                | libc::RTMGRP_IPV6_IFADDR
                | libc::RTMGRP_IPV4_ROUTE) as u32;

            // SAFETY: `addr` lives for the call and the length matches its type.
            let bound = unsafe {
                libc::bind(
                    socket.as_raw_fd(),
                    &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                    mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
                )
            };
            if bound < 0 {
                return Err(io::Error::last_os_error());
            }

            // Wake up periodically to notice cancellation
            let timeout = libc::timeval {
                tv_sec: 0,
                tv_usec: 500_000,
            };
            // SAFETY: `timeout` lives for the call and the length matches its type.
            let set = unsafe {
                libc::setsockopt(
                    socket.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_RCVTIMEO,
                    &timeout as *const libc::timeval as *const libc::c_void,
                    mem::size_of::<libc::timeval>() as libc::socklen_t,
                )
            };
            if set < 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(socket)
        }
    }

    impl EventSource for NetlinkSource {
        fn name(&self) -> &'static str {
            "rtnetlink"
        }

        fn start(&self, triggers: TriggerSender) -> Result<SourceGuard> {
            let socket = Self::open()?;
            let stop = Arc::new(AtomicBool::new(false));
            let stopped = Arc::clone(&stop);

            thread::Builder::new()
                .name("vpnwatch-netlink".to_string())
                .spawn(move || {
                    let mut buffer = [0u8; 8192];
                    while !stopped.load(Ordering::Relaxed) {
                        // SAFETY: `buffer` is valid for writes of its full length.
                        let received = unsafe {
                            libc::recv(
                                socket.as_raw_fd(),
                                buffer.as_mut_ptr() as *mut libc::c_void,
                                buffer.len(),
                                0,
                            )
                        };
                        if received > 0 {
                            if triggers.send(TriggerReason::Connectivity).is_err() {
                                break;
                            }
                            continue;
                        }

                        let error = io::Error::last_os_error();
                        match error.kind() {
                            io::ErrorKind::WouldBlock
                            | io::ErrorKind::TimedOut
                            | io::ErrorKind::Interrupted => continue,
                            _ => {
                                log::warn!("rtnetlink receive failed: {error}");
                                break;
                            }
                        }
                    }
                })?;

            Ok(SourceGuard::new(move || stop.store(true, Ordering::Relaxed)))
        }
    }
}
