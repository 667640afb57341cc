//! C FFI Interface for vpnwatch
//!
//! This module provides C-compatible functions for using VPN detection from
//! applications written in other languages (Swift, Kotlin, C#, etc.).
//! Every function operates on the process-wide shared watcher.
//!
//! Live state changes are delivered through a callback registered with
//! [`vpnwatch_watch`]. Callbacks run on an internal runtime thread.

#![allow(clippy::missing_safety_doc)]

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int, c_void};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::StreamExt;
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;

use crate::monitor::TriggerReason;
use crate::{Config, ConnectionState, StateStream, VpnWatcher, WatchError};

/// Status codes returned by C FFI functions
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnWatchStatus {
    Success = 0,
    InvalidParameter = 1,
    InvalidConfig = 2,
    BufferTooSmall = 3,
    Unsupported = 4,
    InvalidState = 5,
    InternalError = 99,
}

impl From<WatchError> for VpnWatchStatus {
    fn from(error: WatchError) -> Self {
        match error {
            WatchError::Config(_) => VpnWatchStatus::InvalidConfig,
            WatchError::Unsupported(_) => VpnWatchStatus::Unsupported,
            WatchError::InvalidState(_) => VpnWatchStatus::InvalidState,
            _ => VpnWatchStatus::InternalError,
        }
    }
}

/// Callback receiving `1` for connected and `0` for disconnected
pub type VpnStateCallback = extern "C" fn(state: c_int, user_data: *mut c_void);

/// Opaque caller pointer handed back to the callback untouched
struct UserData(*mut c_void);

// SAFETY: the pointer is never dereferenced here; the caller guarantees it is
// usable from the callback thread.
unsafe impl Send for UserData {}

impl UserData {
    fn get(&self) -> *mut c_void {
        self.0
    }
}

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// A registered callback task
struct WatchHandle {
    /// Set under the lock, so no callback is running once `stop` returns
    stopped: Arc<Mutex<bool>>,
    task: JoinHandle<()>,
}

impl WatchHandle {
    fn stop(self) {
        *self.stopped.lock().unwrap_or_else(|e| e.into_inner()) = true;
        self.task.abort();
    }
}

lazy_static::lazy_static! {
    static ref RUNTIME: Option<Runtime> = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("vpnwatch-ffi")
        .enable_all()
        .build()
        .map_err(|e| log::error!("Failed to start FFI runtime: {e}"))
        .ok();
    static ref WATCHES: Mutex<HashMap<u64, WatchHandle>> = Mutex::new(HashMap::new());
}

fn state_code(state: ConnectionState) -> c_int {
    match state {
        ConnectionState::Connected => 1,
        ConnectionState::Disconnected => 0,
    }
}

/// Copy `text` plus a null terminator into a caller buffer
unsafe fn copy_to_buffer(text: &str, buffer: *mut c_char, buffer_len: usize) -> c_int {
    let Ok(text) = CString::new(text) else {
        return VpnWatchStatus::InternalError as c_int;
    };
    let bytes = text.as_bytes_with_nul();
    if bytes.len() > buffer_len {
        return VpnWatchStatus::BufferTooSmall as c_int;
    }

    ptr::copy_nonoverlapping(bytes.as_ptr() as *const c_char, buffer, bytes.len());
    VpnWatchStatus::Success as c_int
}

unsafe fn optional_str<'a>(text: *const c_char) -> Result<Option<&'a str>, VpnWatchStatus> {
    if text.is_null() {
        return Ok(None);
    }
    CStr::from_ptr(text)
        .to_str()
        .map(Some)
        .map_err(|_| VpnWatchStatus::InvalidParameter)
}

/// Initialize the shared watcher from a TOML configuration
///
/// Optional; without it the first call to any other function creates the
/// watcher with default settings.
///
/// # Returns
/// - 0 on success
/// - `InvalidState` if a watcher already exists
/// - Error code on failure
#[no_mangle]
pub unsafe extern "C" fn vpnwatch_init(config_str: *const c_char) -> c_int {
    if config_str.is_null() {
        return VpnWatchStatus::InvalidParameter as c_int;
    }
    let config_str = match CStr::from_ptr(config_str).to_str() {
        Ok(s) => s,
        Err(_) => return VpnWatchStatus::InvalidParameter as c_int,
    };

    let config = match config_str.parse::<Config>() {
        Ok(config) => config,
        Err(err) => return VpnWatchStatus::from(err) as c_int,
    };

    match VpnWatcher::init_shared(config) {
        Ok(_) => VpnWatchStatus::Success as c_int,
        Err(err) => VpnWatchStatus::from(err) as c_int,
    }
}

/// One-shot VPN check
///
/// # Returns
/// - 1 if a VPN is active
/// - 0 otherwise
#[no_mangle]
pub extern "C" fn vpnwatch_is_vpn_active() -> c_int {
    c_int::from(VpnWatcher::shared().is_vpn_active())
}

/// One-shot VPN check with details
///
/// Writes a TOML document with keys `isConnected`, `interfaceName` and
/// `vpnProtocol` (the latter two only when known) into `buffer`.
///
/// # Returns
/// - 0 on success
/// - `BufferTooSmall` if the document and its terminator do not fit
#[no_mangle]
pub unsafe extern "C" fn vpnwatch_get_vpn_info(buffer: *mut c_char, buffer_len: usize) -> c_int {
    if buffer.is_null() || buffer_len == 0 {
        return VpnWatchStatus::InvalidParameter as c_int;
    }

    let info = VpnWatcher::shared().get_vpn_info();
    match info.to_toml() {
        Ok(text) => copy_to_buffer(&text, buffer, buffer_len),
        Err(err) => VpnWatchStatus::from(err) as c_int,
    }
}

/// Last state delivered to subscribers
///
/// # Returns
/// - 1: Connected
/// - 0: Disconnected
/// - -1: Unknown (nothing delivered since the watcher was created)
#[no_mangle]
pub extern "C" fn vpnwatch_current_state() -> c_int {
    VpnWatcher::shared().current_state().map_or(-1, state_code)
}

/// Add an interface-name marker at runtime
///
/// `protocol` may be null.
///
/// # Returns
/// - 1 if the pattern table changed
/// - 0 if the marker was already known
/// - -1 on invalid parameters
#[no_mangle]
pub unsafe extern "C" fn vpnwatch_add_interface_pattern(
    pattern: *const c_char,
    protocol: *const c_char,
) -> c_int {
    let pattern = match optional_str(pattern) {
        Ok(Some(pattern)) => pattern,
        _ => return -1,
    };
    let Ok(protocol) = optional_str(protocol) else {
        return -1;
    };

    c_int::from(VpnWatcher::shared().add_interface_pattern(pattern, protocol))
}

/// Forward an OS network notification received by the host application
///
/// # Parameters
/// - `kind`: 0 connectivity change, 1 path update, 2 VPN status change
///
/// # Returns
/// - 1 if a recheck was queued
/// - 0 if nobody is watching
/// - -1 for an unknown `kind`
#[no_mangle]
pub extern "C" fn vpnwatch_notify_network_change(kind: c_int) -> c_int {
    let reason = match kind {
        0 => TriggerReason::Connectivity,
        1 => TriggerReason::PathUpdate,
        2 => TriggerReason::VpnStatus,
        _ => return -1,
    };
    c_int::from(VpnWatcher::shared().push_source().notify(reason))
}

/// Start delivering state transitions to `callback`
///
/// The current state is delivered shortly after registration. The callback
/// must not call [`vpnwatch_unwatch`] or [`vpnwatch_dispose`] itself.
///
/// # Returns
/// - Non-zero watch handle for [`vpnwatch_unwatch`]
/// - 0 on failure
#[no_mangle]
pub unsafe extern "C" fn vpnwatch_watch(
    callback: Option<VpnStateCallback>,
    user_data: *mut c_void,
) -> u64 {
    let Some(callback) = callback else {
        return 0;
    };
    let Some(runtime) = RUNTIME.as_ref() else {
        return 0;
    };

    let _context = runtime.enter();
    match VpnWatcher::shared().connection_state_stream() {
        Ok(stream) => spawn_watch(runtime, stream, callback, UserData(user_data)),
        Err(e) => {
            log::warn!("Failed to start watch: {e}");
            0
        }
    }
}

/// Run `stream` on the FFI runtime, forwarding each state to `callback`
fn spawn_watch(
    runtime: &Runtime,
    mut stream: StateStream,
    callback: VpnStateCallback,
    user_data: UserData,
) -> u64 {
    let id = NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed);
    let stopped = Arc::new(Mutex::new(false));
    let gate = Arc::clone(&stopped);

    // Held across spawn so a stream that ends at once still finds its entry
    let mut watches = WATCHES.lock().unwrap_or_else(|e| e.into_inner());
    let task = runtime.spawn(async move {
        while let Some(state) = stream.next().await {
            let stopped = gate.lock().unwrap_or_else(|e| e.into_inner());
            if *stopped {
                break;
            }
            callback(state_code(state), user_data.get());
        }
        WATCHES
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        log::debug!("Watch {id} finished");
    });
    watches.insert(id, WatchHandle { stopped, task });
    id
}

/// Stop a watch; the callback is not invoked after this returns
///
/// Waits for a callback that is already running to return.
///
/// # Returns
/// - 0 on success
/// - `InvalidParameter` for an unknown or already finished handle
#[no_mangle]
pub extern "C" fn vpnwatch_unwatch(handle: u64) -> c_int {
    let watch = WATCHES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&handle);
    match watch {
        Some(watch) => {
            watch.stop();
            VpnWatchStatus::Success as c_int
        }
        None => VpnWatchStatus::InvalidParameter as c_int,
    }
}

/// Stop all watches and release the shared watcher
///
/// Safe to call repeatedly. A later call to any other function creates a
/// fresh watcher.
#[no_mangle]
pub extern "C" fn vpnwatch_dispose() {
    let watches: Vec<_> = WATCHES
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .drain()
        .map(|(_, watch)| watch)
        .collect();
    for watch in watches {
        watch.stop();
    }
    VpnWatcher::dispose_shared();
}

/// Get library version
///
/// # Returns
/// - Version string (caller must not free)
#[no_mangle]
pub extern "C" fn vpnwatch_version() -> *const c_char {
    static VERSION_CSTR: &[u8] = concat!(env!("CARGO_PKG_VERSION"), "\0").as_bytes();
    VERSION_CSTR.as_ptr() as *const c_char
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::testing::ScriptedProbe;
    use crate::TunnelInfo;
    use std::sync::atomic::AtomicI32;
    use std::time::{Duration, Instant};

    extern "C" fn ignore_state(_state: c_int, _user_data: *mut c_void) {}

    #[test]
    fn test_version() {
        let version = unsafe { CStr::from_ptr(vpnwatch_version()) };
        assert_eq!(version.to_str().unwrap(), crate::VERSION);
    }

    #[test]
    fn test_vpn_info_round_trips_through_buffer() {
        let mut buffer = vec![0 as c_char; 512];
        let status = unsafe { vpnwatch_get_vpn_info(buffer.as_mut_ptr(), buffer.len()) };
        assert_eq!(status, VpnWatchStatus::Success as c_int);

        let text = unsafe { CStr::from_ptr(buffer.as_ptr()) }.to_str().unwrap();
        assert!(text.contains("isConnected"));
        assert!(TunnelInfo::from_toml(text).is_ok());
    }

    #[test]
    fn test_vpn_info_buffer_checks() {
        let mut tiny = [0 as c_char; 4];
        assert_eq!(
            unsafe { vpnwatch_get_vpn_info(tiny.as_mut_ptr(), tiny.len()) },
            VpnWatchStatus::BufferTooSmall as c_int
        );
        assert_eq!(
            unsafe { vpnwatch_get_vpn_info(ptr::null_mut(), 64) },
            VpnWatchStatus::InvalidParameter as c_int
        );
    }

    #[test]
    fn test_copy_to_buffer_exact_fit() {
        let mut buffer = [1 as c_char; 4];
        let status = unsafe { copy_to_buffer("abc", buffer.as_mut_ptr(), buffer.len()) };
        assert_eq!(status, VpnWatchStatus::Success as c_int);
        assert_eq!(buffer[3], 0);
    }

    #[test]
    fn test_invalid_parameters() {
        assert_eq!(
            unsafe { vpnwatch_add_interface_pattern(ptr::null(), ptr::null()) },
            -1
        );
        assert_eq!(vpnwatch_notify_network_change(7), -1);
        assert_eq!(unsafe { vpnwatch_watch(None, ptr::null_mut()) }, 0);
        assert_eq!(
            vpnwatch_unwatch(u64::MAX),
            VpnWatchStatus::InvalidParameter as c_int
        );
        assert_eq!(
            unsafe { vpnwatch_init(ptr::null()) },
            VpnWatchStatus::InvalidParameter as c_int
        );
    }

    #[test]
    fn test_init_rejects_bad_config() {
        let config = CString::new("[monitor]\nbroadcast_capacity = 0\n").unwrap();
        assert_eq!(
            unsafe { vpnwatch_init(config.as_ptr()) },
            VpnWatchStatus::InvalidConfig as c_int
        );
    }

    #[test]
    fn test_is_vpn_active_is_boolean() {
        let active = vpnwatch_is_vpn_active();
        assert!(active == 0 || active == 1);
    }

    #[test]
    fn test_shared_watch_and_unwatch() {
        let handle = unsafe { vpnwatch_watch(Some(ignore_state), ptr::null_mut()) };
        assert_ne!(handle, 0);
        assert_eq!(vpnwatch_unwatch(handle), VpnWatchStatus::Success as c_int);
        assert_eq!(
            vpnwatch_unwatch(handle),
            VpnWatchStatus::InvalidParameter as c_int
        );
    }

    extern "C" fn record_state(state: c_int, user_data: *mut c_void) {
        // SAFETY: tests register a pointer to a static AtomicI32
        let slot = unsafe { &*(user_data as *const AtomicI32) };
        slot.store(state, Ordering::SeqCst);
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    fn scripted_watcher(names: &[&str]) -> (VpnWatcher, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe::with_interfaces(names));
        let watcher = VpnWatcher::builder()
            .probe(probe.clone())
            .without_system_sources()
            .build()
            .unwrap();
        (watcher, probe)
    }

    fn watch_into(watcher: &VpnWatcher, slot: &'static AtomicI32) -> u64 {
        let runtime = RUNTIME.as_ref().unwrap();
        let _context = runtime.enter();
        let stream = watcher.connection_state_stream().unwrap();
        let user_data = UserData(slot as *const AtomicI32 as *mut c_void);
        spawn_watch(runtime, stream, record_state, user_data)
    }

    fn is_registered(handle: u64) -> bool {
        WATCHES.lock().unwrap().contains_key(&handle)
    }

    #[test]
    fn test_callback_receives_state() {
        static DELIVERED: AtomicI32 = AtomicI32::new(-1);
        let (watcher, _probe) = scripted_watcher(&["eth0", "wg0"]);

        let handle = watch_into(&watcher, &DELIVERED);
        assert_ne!(handle, 0);
        assert!(wait_for(|| DELIVERED.load(Ordering::SeqCst) == 1));

        assert_eq!(vpnwatch_unwatch(handle), VpnWatchStatus::Success as c_int);
        assert!(wait_for(|| watcher.subscriber_count() == 0));
    }

    #[test]
    fn test_no_callback_after_unwatch() {
        static DELIVERED: AtomicI32 = AtomicI32::new(-1);
        let (watcher, probe) = scripted_watcher(&["eth0"]);

        let handle = watch_into(&watcher, &DELIVERED);
        assert!(wait_for(|| DELIVERED.load(Ordering::SeqCst) == 0));
        assert_eq!(vpnwatch_unwatch(handle), VpnWatchStatus::Success as c_int);
        DELIVERED.store(-1, Ordering::SeqCst);

        probe.set_interfaces(&["tun0"]);
        watcher.push_source().notify_path_update();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(DELIVERED.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn test_finished_watch_is_forgotten() {
        static DELIVERED: AtomicI32 = AtomicI32::new(-1);
        let (watcher, _probe) = scripted_watcher(&["ppp0"]);

        let handle = watch_into(&watcher, &DELIVERED);
        assert!(wait_for(|| DELIVERED.load(Ordering::SeqCst) == 1));
        assert!(is_registered(handle));

        // The stream ends on dispose and the task drops its own entry
        watcher.dispose();
        assert!(wait_for(|| !is_registered(handle)));
        assert_eq!(
            vpnwatch_unwatch(handle),
            VpnWatchStatus::InvalidParameter as c_int
        );
    }

    #[test]
    fn test_status_from_error() {
        assert_eq!(
            VpnWatchStatus::from(WatchError::Config("bad".into())),
            VpnWatchStatus::InvalidConfig
        );
        assert_eq!(
            VpnWatchStatus::from(WatchError::Timeout("slow".into())),
            VpnWatchStatus::InternalError
        );
    }
}
