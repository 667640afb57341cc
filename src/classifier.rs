//! Interface-name classification
//!
//! Decides from a list of interface names whether any of them looks like a
//! VPN tunnel, and which protocol it most likely carries. Names are matched
//! lowercased against a table of substring markers; per-platform ignore
//! lists are consulted first so that known system tunnels never count.

use crate::config::{DetectionConfig, IgnoreConfig};
use crate::state::TunnelInfo;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

/// Host operating system family, used to pick ignore lists and strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Linux,
    MacOs,
    Ios,
    Android,
    Windows,
    Other,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Linux,
        Platform::MacOs,
        Platform::Ios,
        Platform::Android,
        Platform::Windows,
        Platform::Other,
    ];

    /// The platform this binary was compiled for
    pub fn current() -> Self {
        if cfg!(target_os = "android") {
            Platform::Android
        } else if cfg!(target_os = "linux") {
            Platform::Linux
        } else if cfg!(target_os = "ios") {
            Platform::Ios
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "windows") {
            Platform::Windows
        } else {
            Platform::Other
        }
    }
}

/// Built-in markers and their protocol labels
const BUILTIN_PATTERNS: &[(&str, Option<&str>)] = &[
    ("tun", Some("TUN/TAP")),
    ("tap", Some("TUN/TAP")),
    ("ppp", Some("PPP")),
    ("pptp", Some("PPTP")),
    ("l2tp", Some("L2TP")),
    ("ipsec", Some("IPSec")),
    ("wg", Some("WireGuard")),
    ("wireguard", Some("WireGuard")),
    ("nordlynx", Some("WireGuard")),
    ("openvpn", Some("OpenVPN")),
    ("ovpn", Some("OpenVPN")),
    ("anyconnect", Some("AnyConnect")),
    ("cscotun", Some("AnyConnect")),
    ("gpd", Some("GlobalProtect")),
    ("vpn", None),
];

/// One substring marker with an optional protocol label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePattern {
    marker: String,
    protocol: Option<String>,
}

impl InterfacePattern {
    pub fn marker(&self) -> &str {
        &self.marker
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}

/// Append-only table of interface-name markers
#[derive(Debug, Clone, Default)]
pub struct PatternTable {
    patterns: Vec<InterfacePattern>,
}

impl PatternTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table preloaded with the built-in markers
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (marker, protocol) in BUILTIN_PATTERNS {
            table.add(marker, *protocol);
        }
        table
    }

    /// Append a marker; returns whether the table changed
    ///
    /// Markers are stored lowercased. Re-adding a known marker can only fill
    /// in a missing protocol label, never replace an existing one.
    pub fn add(&mut self, marker: &str, protocol: Option<&str>) -> bool {
        let marker = marker.trim().to_lowercase();
        if marker.is_empty() {
            return false;
        }
        let protocol = protocol
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string);

        if let Some(existing) = self.patterns.iter_mut().find(|p| p.marker == marker) {
            if existing.protocol.is_none() && protocol.is_some() {
                existing.protocol = protocol;
                return true;
            }
            return false;
        }

        self.patterns.push(InterfacePattern { marker, protocol });
        true
    }

    /// Longest marker contained in an already-lowercased name
    ///
    /// Ties go to the marker that was added first.
    pub fn best_match(&self, lowered: &str) -> Option<&InterfacePattern> {
        self.patterns
            .iter()
            .filter(|p| lowered.contains(p.marker.as_str()))
            .fold(None, |best: Option<&InterfacePattern>, candidate| match best {
                Some(current) if current.marker.len() >= candidate.marker.len() => Some(current),
                _ => Some(candidate),
            })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InterfacePattern> {
        self.patterns.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum IgnoreEntry {
    Exact(String),
    Prefix(String),
}

/// Known false-positive interface names for one platform
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreList {
    entries: Vec<IgnoreEntry>,
}

impl IgnoreList {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Built-in entries for a platform
    pub fn defaults(platform: Platform) -> Self {
        let entries: &[&str] = match platform {
            // System relay / keepalive tunnels present without any user VPN
            Platform::MacOs => &["utun0", "utun1", "utun2", "utun3"],
            Platform::Ios => &["ipsec*", "utun0", "utun1", "utun2", "utun3"],
            Platform::Windows => &["teredo*", "isatap*", "6to4*"],
            Platform::Linux => &["gretap*"],
            Platform::Android | Platform::Other => &[],
        };
        let mut list = Self::empty();
        for entry in entries {
            list.add(entry);
        }
        list
    }

    /// Defaults for a platform merged with (or replaced by) configured entries
    pub fn from_config(platform: Platform, config: &IgnoreConfig) -> Self {
        let mut list = if config.replace_defaults {
            Self::empty()
        } else {
            Self::defaults(platform)
        };
        for entry in config.entries_for(platform) {
            list.add(entry);
        }
        list
    }

    /// Add an entry; a trailing `*` makes it a prefix match
    pub fn add(&mut self, entry: &str) {
        let entry = entry.trim().to_lowercase();
        let parsed = match entry.strip_suffix('*') {
            Some("") => return,
            Some(prefix) => IgnoreEntry::Prefix(prefix.to_string()),
            None if entry.is_empty() => return,
            None => IgnoreEntry::Exact(entry),
        };
        if !self.entries.contains(&parsed) {
            self.entries.push(parsed);
        }
    }

    /// Whether an already-lowercased name is a known false positive
    pub fn is_ignored(&self, lowered: &str) -> bool {
        self.entries.iter().any(|entry| match entry {
            IgnoreEntry::Exact(name) => lowered == name,
            IgnoreEntry::Prefix(prefix) => lowered.starts_with(prefix.as_str()),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Interface-name classifier with a runtime-extensible pattern table
#[derive(Debug)]
pub struct InterfaceClassifier {
    patterns: RwLock<PatternTable>,
    ignore: HashMap<Platform, IgnoreList>,
}

impl InterfaceClassifier {
    /// Classifier with explicit tables; platforms without a list ignore nothing
    pub fn new(patterns: PatternTable, ignore: HashMap<Platform, IgnoreList>) -> Self {
        Self {
            patterns: RwLock::new(patterns),
            ignore,
        }
    }

    /// Built-in table plus configured markers and ignore lists
    pub fn from_config(config: &DetectionConfig) -> Self {
        let mut patterns = PatternTable::builtin();
        for entry in &config.patterns {
            patterns.add(&entry.marker, entry.protocol.as_deref());
        }

        let ignore = Platform::ALL
            .iter()
            .map(|platform| (*platform, IgnoreList::from_config(*platform, &config.ignore)))
            .collect();

        Self::new(patterns, ignore)
    }

    /// Classify interface names in the order the OS returned them
    ///
    /// The first non-ignored interface containing a marker decides the result;
    /// its name is reported as given, not lowercased.
    pub fn classify<I, S>(&self, names: I, platform: Platform) -> TunnelInfo
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let patterns = self.patterns.read().unwrap_or_else(|e| e.into_inner());
        let ignore = self.ignore.get(&platform);

        for name in names {
            let name = name.as_ref();
            let lowered = name.to_lowercase();

            if ignore.is_some_and(|list| list.is_ignored(&lowered)) {
                log::trace!("Ignoring known system interface {name}");
                continue;
            }

            if let Some(pattern) = patterns.best_match(&lowered) {
                log::debug!(
                    "Interface {name} matches marker '{}' ({})",
                    pattern.marker(),
                    pattern.protocol().unwrap_or("unknown protocol")
                );
                return TunnelInfo::connected(
                    Some(name.to_string()),
                    pattern.protocol().map(str::to_string),
                );
            }
        }

        TunnelInfo::disconnected()
    }

    /// Append a marker to the pattern table at runtime
    pub fn add_pattern(&self, marker: &str, protocol: Option<&str>) -> bool {
        let mut patterns = self.patterns.write().unwrap_or_else(|e| e.into_inner());
        let added = patterns.add(marker, protocol);
        if added {
            log::info!("Added interface pattern '{}'", marker.trim().to_lowercase());
        }
        added
    }

    /// Snapshot of the current pattern table
    pub fn patterns(&self) -> PatternTable {
        self.patterns
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for InterfaceClassifier {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}
