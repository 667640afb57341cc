//! macOS signal sources via `scutil --nc list`

#![cfg_attr(not(target_os = "macos"), allow(dead_code, unused_imports))]

use super::VpnProfileStatus;
use crate::error::Result;
use regex::Regex;

lazy_static::lazy_static! {
    static ref STATE_COLUMN: Option<Regex> = Regex::new(r"^\*?\s*\((\w+)\)").ok();
}

/// Status of configured VPN network services (IKEv2, L2TP, IPSec, ...)
#[cfg(target_os = "macos")]
pub fn network_service_status(timeout: std::time::Duration) -> Result<Option<VpnProfileStatus>> {
    let output = super::run_command("scutil", &["--nc", "list"], timeout)?;
    Ok(parse_nc_list(&output))
}

/// Fold the `(State)` column of `scutil --nc list` output
pub fn parse_nc_list(output: &str) -> Option<VpnProfileStatus> {
    let Some(state_column) = STATE_COLUMN.as_ref() else {
        return None;
    };

    let statuses = output.lines().filter_map(|line| {
        let captures = state_column.captures(line.trim_start())?;
        Some(match &captures[1] {
            "Connected" => VpnProfileStatus::Connected,
            "Connecting" => VpnProfileStatus::Connecting,
            "Disconnecting" => VpnProfileStatus::Disconnecting,
            "Disconnected" => VpnProfileStatus::Disconnected,
            _ => VpnProfileStatus::Unknown,
        })
    });
    VpnProfileStatus::strongest(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_compiles_once() {
        assert!(STATE_COLUMN.is_some());
    }

    #[test]
    fn test_nc_list_connected() {
        let output = r#"Available network connection services in the current set (*=enabled):
* (Disconnected)   9B1C2E4A-0000-4000-8000-000000000001 IPSec              "Office"                         [IPSec]
* (Connected)      9B1C2E4A-0000-4000-8000-000000000002 VPN (com.wireguard.macos) "Home WG"               [VPN/WireGuard]
"#;
        assert_eq!(parse_nc_list(output), Some(VpnProfileStatus::Connected));
    }

    #[test]
    fn test_nc_list_disconnected_and_empty() {
        let output = r#"Available network connection services in the current set (*=enabled):
* (Disconnected)   9B1C2E4A-0000-4000-8000-000000000001 PPP --> L2TP       "Travel"                         [PPP/L2TP]
  (Invalid)        9B1C2E4A-0000-4000-8000-000000000003 IPSec              "Old"                            [IPSec]
"#;
        assert_eq!(parse_nc_list(output), Some(VpnProfileStatus::Disconnected));

        let header_only = "Available network connection services in the current set (*=enabled):\n";
        assert_eq!(parse_nc_list(header_only), None);
    }
}
