//! Platform signal sources
//!
//! Everything the detector learns about the host goes through the
//! [`PlatformProbe`] trait: interface enumeration, the "active path is VPN
//! transport" capability flag, and the status of a configured VPN profile.
//! [`SystemProbe`] implements it for the compiled-for OS; bindings that have
//! access to privileged native APIs can supply their own implementation.

pub mod linux;
pub mod macos;
#[cfg(unix)]
pub mod unix;
pub mod windows;

use crate::classifier::Platform;
use crate::error::{Result, WatchError};
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// One entry from interface enumeration
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetworkInterface {
    pub name: String,
    pub is_up: bool,
}

impl NetworkInterface {
    pub fn new(name: impl Into<String>, is_up: bool) -> Self {
        Self {
            name: name.into(),
            is_up,
        }
    }
}

/// Status of a persistently configured VPN profile
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnProfileStatus {
    Unknown,
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl VpnProfileStatus {
    pub fn is_connected(self) -> bool {
        self == VpnProfileStatus::Connected
    }

    /// Collapse several profiles into the single most significant status
    pub fn strongest<I: IntoIterator<Item = VpnProfileStatus>>(statuses: I) -> Option<Self> {
        statuses.into_iter().max_by_key(|status| status.rank())
    }

    fn rank(self) -> u8 {
        match self {
            VpnProfileStatus::Unknown => 0,
            VpnProfileStatus::Disconnected => 1,
            VpnProfileStatus::Disconnecting => 2,
            VpnProfileStatus::Connecting => 3,
            VpnProfileStatus::Connected => 4,
        }
    }
}

/// Access to the host's network signals
///
/// The capability flag and profile status default to `Unsupported`, which the
/// detector treats as "strategy not applicable".
pub trait PlatformProbe: Send + Sync {
    /// Which platform's ignore list applies to this probe's interface names
    fn platform(&self) -> Platform;

    /// All network interfaces in OS order
    fn interfaces(&self) -> Result<Vec<NetworkInterface>>;

    /// Whether the active default path is flagged as VPN transport
    fn vpn_transport_flag(&self) -> Result<bool> {
        Err(WatchError::Unsupported("capability flag".to_string()))
    }

    /// Status of the configured VPN profile, `None` if nothing is configured
    fn vpn_profile_status(&self) -> Result<Option<VpnProfileStatus>> {
        Err(WatchError::Unsupported("VPN profile status".to_string()))
    }
}

/// Probe backed by the OS this binary runs on
#[derive(Debug, Clone)]
pub struct SystemProbe {
    platform: Platform,
    timeout: Duration,
}

impl SystemProbe {
    /// `timeout` bounds every external query the probe makes
    pub fn new(timeout: Duration) -> Self {
        Self {
            platform: Platform::current(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(2))
    }
}

impl PlatformProbe for SystemProbe {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn interfaces(&self) -> Result<Vec<NetworkInterface>> {
        #[cfg(unix)]
        {
            unix::interfaces()
        }
        #[cfg(windows)]
        {
            windows::interfaces(self.timeout)
        }
        #[cfg(not(any(unix, windows)))]
        {
            Err(WatchError::Unsupported("interface enumeration".to_string()))
        }
    }

    fn vpn_transport_flag(&self) -> Result<bool> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            linux::default_route_is_tunnel()
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            Err(WatchError::Unsupported("capability flag".to_string()))
        }
    }

    fn vpn_profile_status(&self) -> Result<Option<VpnProfileStatus>> {
        #[cfg(target_os = "linux")]
        {
            linux::network_manager_status(self.timeout)
        }
        #[cfg(target_os = "macos")]
        {
            macos::network_service_status(self.timeout)
        }
        #[cfg(windows)]
        {
            windows::ras_status(self.timeout)
        }
        #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
        {
            Err(WatchError::Unsupported("VPN profile status".to_string()))
        }
    }
}

/// Run an external command and return its stdout, killing it on timeout
///
/// A missing executable is reported as `Unsupported`.
pub fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                WatchError::Unsupported(format!("{program} is not installed"))
            } else {
                WatchError::Query(format!("Failed to run {program}: {e}"))
            }
        })?;

    // Drain stdout concurrently so a chatty child cannot block on a full pipe
    let (output_tx, output_rx) = mpsc::channel();
    if let Some(mut stdout) = child.stdout.take() {
        thread::spawn(move || {
            let mut buffer = Vec::new();
            let _ = stdout.read_to_end(&mut buffer);
            let _ = output_tx.send(buffer);
        });
    }

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {}
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(WatchError::Query(format!("Failed to wait for {program}: {e}")));
            }
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return Err(timed_out(program, timeout));
        }
        thread::sleep(Duration::from_millis(10));
    };

    // A background grandchild may keep the pipe open past the exit
    let remaining = deadline.saturating_duration_since(Instant::now());
    let output = match output_rx.recv_timeout(remaining) {
        Ok(output) => output,
        Err(mpsc::RecvTimeoutError::Disconnected) => Vec::new(),
        Err(mpsc::RecvTimeoutError::Timeout) => return Err(timed_out(program, timeout)),
    };

    if !status.success() {
        return Err(WatchError::Query(format!("{program} exited with {status}")));
    }

    Ok(String::from_utf8_lossy(&output).into_owned())
}

fn timed_out(program: &str, timeout: Duration) -> WatchError {
    WatchError::Timeout(format!(
        "{program} did not finish within {}ms",
        timeout.as_millis()
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted probe for driving the detector deterministically

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum Scripted<T> {
        Value(T),
        Unsupported,
        Fail,
    }

    #[derive(Debug)]
    pub struct ScriptedProbe {
        pub platform: Platform,
        pub interfaces: Mutex<Scripted<Vec<NetworkInterface>>>,
        pub flag: Mutex<Scripted<bool>>,
        pub status: Mutex<Scripted<Option<VpnProfileStatus>>>,
        pub enumerations: AtomicUsize,
    }

    impl ScriptedProbe {
        pub fn with_interfaces(names: &[&str]) -> Self {
            Self {
                platform: Platform::Linux,
                interfaces: Mutex::new(Scripted::Value(
                    names.iter().map(|n| NetworkInterface::new(*n, true)).collect(),
                )),
                flag: Mutex::new(Scripted::Unsupported),
                status: Mutex::new(Scripted::Unsupported),
                enumerations: AtomicUsize::new(0),
            }
        }

        pub fn set_interfaces(&self, names: &[&str]) {
            *self.interfaces.lock().unwrap() = Scripted::Value(
                names.iter().map(|n| NetworkInterface::new(*n, true)).collect(),
            );
        }

        pub fn set_flag(&self, flag: Scripted<bool>) {
            *self.flag.lock().unwrap() = flag;
        }

        pub fn set_status(&self, status: Scripted<Option<VpnProfileStatus>>) {
            *self.status.lock().unwrap() = status;
        }

        pub fn fail_enumeration(&self) {
            *self.interfaces.lock().unwrap() = Scripted::Fail;
        }
    }

    fn resolve<T: Clone>(scripted: &Mutex<Scripted<T>>, what: &str) -> Result<T> {
        match &*scripted.lock().unwrap() {
            Scripted::Value(value) => Ok(value.clone()),
            Scripted::Unsupported => Err(WatchError::Unsupported(what.to_string())),
            Scripted::Fail => Err(WatchError::Query(format!("{what} failed"))),
        }
    }

    impl PlatformProbe for ScriptedProbe {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn interfaces(&self) -> Result<Vec<NetworkInterface>> {
            self.enumerations.fetch_add(1, Ordering::SeqCst);
            resolve(&self.interfaces, "enumeration")
                .map_err(|_| WatchError::Enumeration("permission denied".to_string()))
        }

        fn vpn_transport_flag(&self) -> Result<bool> {
            resolve(&self.flag, "capability flag")
        }

        fn vpn_profile_status(&self) -> Result<Option<VpnProfileStatus>> {
            resolve(&self.status, "profile status")
        }
    }
}
