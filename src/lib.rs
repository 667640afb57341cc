//! vpnwatch - Cross-platform VPN presence detection
//!
//! Answers "is traffic on this device going through a VPN right now?" and
//! keeps subscribers informed when the answer changes.
//!
//! ## What This Library Provides
//! - One-shot checks: [`VpnWatcher::is_vpn_active`] and [`VpnWatcher::get_vpn_info`]
//! - A live, deduplicated [`StateStream`] of [`ConnectionState`] transitions
//! - Layered detection (OS capability flag, VPN profile status, interface names)
//! - A runtime-extensible interface pattern table
//! - Configuration in TOML format
//! - C FFI bindings for integration with other languages
//!
//! ## What Your Application May Provide
//! - A [`platform::PlatformProbe`] backed by native APIs the OS only exposes
//!   to applications (e.g. path capability flags on mobile platforms)
//! - OS notifications forwarded through [`monitor::PushSource`]
//!
//! ```no_run
//! use futures::StreamExt;
//! use vpnwatch::VpnWatcher;
//!
//! # async fn run() -> vpnwatch::Result<()> {
//! let watcher = VpnWatcher::shared();
//! println!("VPN active: {}", watcher.is_vpn_active());
//!
//! let mut states = watcher.connection_state_stream()?;
//! while let Some(state) = states.next().await {
//!     println!("VPN is now {state}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod classifier;
pub mod config;
pub mod detector;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod service;
pub mod state;

// Re-export core types
pub use classifier::{InterfaceClassifier, PatternTable, Platform};
pub use config::Config;
pub use error::{Result, WatchError};
pub use service::{StateStream, VpnWatcher, VpnWatcherBuilder};
pub use state::{ConnectionState, TunnelInfo};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// C FFI Interface for cross-platform integration
pub mod ffi;
