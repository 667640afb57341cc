//! Linux signal sources
//!
//! The capability flag is derived from the main routing table: if the default
//! route leaves through a tun/WireGuard/PPP link, the active path is VPN
//! transport. Profile status comes from NetworkManager when it is running.

#![cfg_attr(
    not(any(target_os = "linux", target_os = "android")),
    allow(dead_code, unused_imports)
)]

use super::VpnProfileStatus;
use crate::error::{Result, WatchError};
use std::fs;
use std::path::Path;

/// Link types that only virtual point-to-point tunnels use
const ARPHRD_PPP: u32 = 512;
const ARPHRD_NONE: u32 = 65534;

const PROC_NET_ROUTE: &str = "/proc/net/route";
const SYS_CLASS_NET: &str = "/sys/class/net";

/// Whether the default route goes through a tunnel-type link
#[cfg(any(target_os = "linux", target_os = "android"))]
pub fn default_route_is_tunnel() -> Result<bool> {
    let table = fs::read_to_string(PROC_NET_ROUTE)
        .map_err(|e| WatchError::Query(format!("Failed to read {PROC_NET_ROUTE}: {e}")))?;

    match parse_default_route(&table) {
        Some(interface) => {
            let tunnel = link_is_tunnel(Path::new(SYS_CLASS_NET), &interface);
            log::debug!("Default route via {interface} (tunnel link: {tunnel})");
            Ok(tunnel)
        }
        None => Ok(false),
    }
}

/// VPN and WireGuard connection status as reported by NetworkManager
#[cfg(target_os = "linux")]
pub fn network_manager_status(timeout: std::time::Duration) -> Result<Option<VpnProfileStatus>> {
    let output = super::run_command(
        "nmcli",
        &["-t", "-f", "TYPE,STATE", "connection", "show", "--active"],
        timeout,
    )?;
    Ok(parse_nmcli_active(&output))
}

/// Interface of the lowest-metric IPv4 default route in `/proc/net/route`
pub fn parse_default_route(table: &str) -> Option<String> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 8 {
                return None;
            }
            let (iface, destination, metric, mask) = (fields[0], fields[1], fields[6], fields[7]);
            if destination != "00000000" || mask != "00000000" {
                return None;
            }
            let metric = metric.parse::<u32>().unwrap_or(u32::MAX);
            Some((metric, iface))
        })
        .min_by_key(|(metric, _)| *metric)
        .map(|(_, iface)| iface.to_string())
}

/// Whether a link under `sys_root` is a tun device or a point-to-point tunnel
pub fn link_is_tunnel(sys_root: &Path, interface: &str) -> bool {
    let link = sys_root.join(interface);
    if link.join("tun_flags").exists() {
        return true;
    }

    fs::read_to_string(link.join("type"))
        .ok()
        .and_then(|t| t.trim().parse::<u32>().ok())
        .is_some_and(|link_type| link_type == ARPHRD_NONE || link_type == ARPHRD_PPP)
}

/// Fold `nmcli -t -f TYPE,STATE` lines for VPN-like connections
pub fn parse_nmcli_active(output: &str) -> Option<VpnProfileStatus> {
    let statuses = output.lines().filter_map(|line| {
        let (kind, state) = line.trim().rsplit_once(':')?;
        if kind != "vpn" && kind != "wireguard" {
            return None;
        }
        Some(match state {
            "activated" => VpnProfileStatus::Connected,
            "activating" => VpnProfileStatus::Connecting,
            "deactivating" => VpnProfileStatus::Disconnecting,
            "deactivated" => VpnProfileStatus::Disconnected,
            _ => VpnProfileStatus::Unknown,
        })
    });
    VpnProfileStatus::strongest(statuses)
}
