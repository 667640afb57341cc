//! Connection state and tunnel metadata value types
//!
//! [`TunnelInfo`] crosses the binding boundary as a flat string-keyed map
//! (`isConnected`, `interfaceName`, `vpnProtocol`). The same map is used for
//! serde, so any serde format sees identical keys.

use crate::error::{Result, WatchError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Key carrying the connected flag in the flat map
pub const KEY_IS_CONNECTED: &str = "isConnected";
/// Key carrying the interface name in the flat map
pub const KEY_INTERFACE_NAME: &str = "interfaceName";
/// Key carrying the inferred protocol in the flat map
pub const KEY_VPN_PROTOCOL: &str = "vpnProtocol";

/// VPN presence as observed at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Disconnected,
}

impl ConnectionState {
    /// Derive the state from an "is active" signal
    pub fn from_active(active: bool) -> Self {
        if active {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// A single value in the flat wire map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Bool(bool),
    Text(String),
}

/// Flat string-keyed map used for cross-boundary transport
pub type FlatMap = BTreeMap<String, WireValue>;

/// Result of one detection pass
///
/// Interface name and protocol are only ever present when connected; the
/// constructors are the only way to build one, so the invariant holds for
/// every value in circulation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "FlatMap", into = "FlatMap")]
pub struct TunnelInfo {
    is_connected: bool,
    interface_name: Option<String>,
    protocol: Option<String>,
}

impl TunnelInfo {
    /// No tunnel present
    pub fn disconnected() -> Self {
        Self {
            is_connected: false,
            interface_name: None,
            protocol: None,
        }
    }

    /// A tunnel is present, with whatever identity could be discovered
    pub fn connected(interface_name: Option<String>, protocol: Option<String>) -> Self {
        Self {
            is_connected: true,
            interface_name,
            protocol,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected
    }

    pub fn interface_name(&self) -> Option<&str> {
        self.interface_name.as_deref()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_active(self.is_connected)
    }

    /// Encode as the flat wire map; absent fields are omitted
    pub fn to_map(&self) -> FlatMap {
        let mut map = FlatMap::new();
        map.insert(
            KEY_IS_CONNECTED.to_string(),
            WireValue::Bool(self.is_connected),
        );
        if let Some(name) = &self.interface_name {
            map.insert(KEY_INTERFACE_NAME.to_string(), WireValue::Text(name.clone()));
        }
        if let Some(protocol) = &self.protocol {
            map.insert(KEY_VPN_PROTOCOL.to_string(), WireValue::Text(protocol.clone()));
        }
        map
    }

    /// Decode from the flat wire map
    ///
    /// A disconnected map never yields interface or protocol fields, even if
    /// the sender included them.
    pub fn from_map(map: &FlatMap) -> Result<Self> {
        let is_connected = match map.get(KEY_IS_CONNECTED) {
            Some(WireValue::Bool(flag)) => *flag,
            Some(WireValue::Text(text)) => match text.as_str() {
                "true" => true,
                "false" => false,
                other => {
                    return Err(WatchError::Wire(format!(
                        "{KEY_IS_CONNECTED} is not a boolean: {other}"
                    )))
                }
            },
            None => return Err(WatchError::Wire(format!("missing {KEY_IS_CONNECTED}"))),
        };

        if !is_connected {
            if map.contains_key(KEY_INTERFACE_NAME) || map.contains_key(KEY_VPN_PROTOCOL) {
                log::debug!("Dropping tunnel identity fields from a disconnected map");
            }
            return Ok(Self::disconnected());
        }

        Ok(Self::connected(
            optional_text(map, KEY_INTERFACE_NAME)?,
            optional_text(map, KEY_VPN_PROTOCOL)?,
        ))
    }

    /// Encode the flat map as a TOML document
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(&self.to_map())
            .map_err(|e| WatchError::Wire(format!("Failed to serialize tunnel info: {e}")))
    }

    /// Decode a TOML document produced by [`TunnelInfo::to_toml`]
    pub fn from_toml(content: &str) -> Result<Self> {
        let map: FlatMap = toml::from_str(content)
            .map_err(|e| WatchError::Wire(format!("Failed to parse tunnel info: {e}")))?;
        Self::from_map(&map)
    }
}

impl Default for TunnelInfo {
    fn default() -> Self {
        Self::disconnected()
    }
}

impl TryFrom<FlatMap> for TunnelInfo {
    type Error = WatchError;

    fn try_from(map: FlatMap) -> Result<Self> {
        Self::from_map(&map)
    }
}

impl From<TunnelInfo> for FlatMap {
    fn from(info: TunnelInfo) -> Self {
        info.to_map()
    }
}

fn optional_text(map: &FlatMap, key: &str) -> Result<Option<String>> {
    match map.get(key) {
        None => Ok(None),
        Some(WireValue::Text(text)) => Ok(Some(text.clone())),
        Some(WireValue::Bool(_)) => Err(WatchError::Wire(format!("{key} must be a string"))),
    }
}
