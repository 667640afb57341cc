//! Windows signal sources via `netsh` and `rasdial`

#![cfg_attr(not(windows), allow(dead_code, unused_imports))]

use super::{NetworkInterface, VpnProfileStatus};
use crate::error::{Result, WatchError};
use regex::Regex;
use std::time::Duration;

lazy_static::lazy_static! {
    static ref NETSH_ROW: Option<Regex> = Regex::new(r"^(\S+)\s+(\S+)\s+(\S+)\s+(.+?)\s*$").ok();
}

/// Enumerate interfaces with `netsh interface show interface`
#[cfg(windows)]
pub fn interfaces(timeout: Duration) -> Result<Vec<NetworkInterface>> {
    let output = super::run_command("netsh", &["interface", "show", "interface"], timeout)
        .map_err(|e| WatchError::Enumeration(format!("Failed to list interfaces: {e}")))?;
    Ok(parse_netsh_interfaces(&output))
}

/// Status of RAS (built-in VPN client) connections
#[cfg(windows)]
pub fn ras_status(timeout: Duration) -> Result<Option<VpnProfileStatus>> {
    let output = super::run_command("rasdial", &[], timeout)?;
    Ok(parse_rasdial(&output))
}

/// Parse the table printed by `netsh interface show interface`
///
/// Columns are Admin State, State, Type and Interface Name; the name may
/// contain spaces, so it is everything after the third column.
pub fn parse_netsh_interfaces(output: &str) -> Vec<NetworkInterface> {
    let Some(row) = NETSH_ROW.as_ref() else {
        return Vec::new();
    };

    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("---"))
        .skip(1)
        .filter_map(|line| {
            let captures = row.captures(line)?;
            Some(NetworkInterface::new(
                &captures[4],
                captures[2].eq_ignore_ascii_case("connected"),
            ))
        })
        .collect()
}

/// Interpret `rasdial` with no arguments
pub fn parse_rasdial(output: &str) -> Option<VpnProfileStatus> {
    if output.contains("Connected to") {
        Some(VpnProfileStatus::Connected)
    } else if output.contains("No connections") {
        Some(VpnProfileStatus::Disconnected)
    } else {
        None
    }
}
