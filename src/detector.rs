//! Primary VPN detector
//!
//! Runs the enabled strategies in a fixed priority order and stops at the
//! first positive:
//!
//! 1. capability flag on the active path (authoritative)
//! 2. status of a configured VPN profile
//! 3. interface-name classification
//!
//! A failing or unsupported strategy counts as negative for that strategy only.
//! Nothing here returns an error; the worst outcome is a false negative.

use crate::classifier::InterfaceClassifier;
use crate::config::DetectionConfig;
use crate::error::WatchError;
use crate::platform::PlatformProbe;
use crate::state::TunnelInfo;
use std::fmt;
use std::sync::Arc;

/// One way of finding out whether a VPN is up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    CapabilityFlag,
    ProfileStatus,
    InterfaceNames,
}

impl Strategy {
    /// Enabled strategies in priority order
    pub fn enabled(config: &DetectionConfig) -> Vec<Strategy> {
        let mut strategies = Vec::with_capacity(3);
        if config.use_capability_flag {
            strategies.push(Strategy::CapabilityFlag);
        }
        if config.use_profile_status {
            strategies.push(Strategy::ProfileStatus);
        }
        if config.use_interface_names {
            strategies.push(Strategy::InterfaceNames);
        }
        strategies
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::CapabilityFlag => f.write_str("capability flag"),
            Strategy::ProfileStatus => f.write_str("profile status"),
            Strategy::InterfaceNames => f.write_str("interface names"),
        }
    }
}

/// Stateless detector over a platform probe
pub struct Detector {
    probe: Arc<dyn PlatformProbe>,
    classifier: Arc<InterfaceClassifier>,
    strategies: Vec<Strategy>,
    only_active_interfaces: bool,
}

impl Detector {
    pub fn new(
        probe: Arc<dyn PlatformProbe>,
        classifier: Arc<InterfaceClassifier>,
        config: &DetectionConfig,
    ) -> Self {
        Self {
            probe,
            classifier,
            strategies: Strategy::enabled(config),
            only_active_interfaces: config.only_active_interfaces,
        }
    }

    pub fn strategies(&self) -> &[Strategy] {
        &self.strategies
    }

    pub fn classifier(&self) -> &Arc<InterfaceClassifier> {
        &self.classifier
    }

    /// Whether any strategy reports an active VPN
    pub fn detect(&self) -> bool {
        self.strategies
            .iter()
            .any(|strategy| self.run(*strategy).is_some())
    }

    /// Like [`Detector::detect`], plus interface name and protocol when known
    ///
    /// A positive from the flag or profile status carries no identity, so the
    /// interfaces are classified afterwards to fill it in where possible.
    pub fn detect_info(&self) -> TunnelInfo {
        for strategy in &self.strategies {
            let Some(info) = self.run(*strategy) else {
                continue;
            };
            if info.interface_name().is_some() {
                return info;
            }

            let classified = self.classify_interfaces();
            return if classified.is_connected() {
                classified
            } else {
                info
            };
        }

        TunnelInfo::disconnected()
    }

    /// Run one strategy; `Some` only on a positive result
    fn run(&self, strategy: Strategy) -> Option<TunnelInfo> {
        let positive = match strategy {
            Strategy::CapabilityFlag => match self.probe.vpn_transport_flag() {
                Ok(flag) => flag.then(|| TunnelInfo::connected(None, None)),
                Err(e) => self.negative(strategy, e),
            },
            Strategy::ProfileStatus => match self.probe.vpn_profile_status() {
                Ok(status) => status
                    .filter(|s| s.is_connected())
                    .map(|_| TunnelInfo::connected(None, None)),
                Err(e) => self.negative(strategy, e),
            },
            Strategy::InterfaceNames => {
                Some(self.classify_interfaces()).filter(TunnelInfo::is_connected)
            }
        };

        log::debug!(
            "Strategy '{strategy}': {}",
            if positive.is_some() { "VPN present" } else { "no VPN" }
        );
        positive
    }

    /// Classify the current interface list; enumeration failure is negative
    fn classify_interfaces(&self) -> TunnelInfo {
        let interfaces = match self.probe.interfaces() {
            Ok(interfaces) => interfaces,
            Err(e) => {
                self.negative(Strategy::InterfaceNames, e);
                return TunnelInfo::disconnected();
            }
        };

        let names = interfaces
            .iter()
            .filter(|i| i.is_up || !self.only_active_interfaces)
            .map(|i| i.name.as_str());
        self.classifier.classify(names, self.probe.platform())
    }

    fn negative(&self, strategy: Strategy, error: WatchError) -> Option<TunnelInfo> {
        if error.is_unsupported() {
            log::debug!("Strategy '{strategy}' not applicable: {error}");
        } else {
            log::warn!("Strategy '{strategy}' failed, treating as no VPN: {error}");
        }
        None
    }
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("platform", &self.probe.platform())
            .field("strategies", &self.strategies)
            .field("only_active_interfaces", &self.only_active_interfaces)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{PatternTable, Platform};
    use crate::platform::testing::{Scripted, ScriptedProbe};
    use crate::platform::{NetworkInterface, VpnProfileStatus};
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    fn detector(probe: Arc<ScriptedProbe>) -> Detector {
        Detector::new(
            probe,
            Arc::new(InterfaceClassifier::default()),
            &DetectionConfig::default(),
        )
    }

    #[test]
    fn test_strategy_order_follows_config() {
        let mut config = DetectionConfig::default();
        assert_eq!(
            Strategy::enabled(&config),
            vec![
                Strategy::CapabilityFlag,
                Strategy::ProfileStatus,
                Strategy::InterfaceNames
            ]
        );
        config.use_profile_status = false;
        assert_eq!(
            Strategy::enabled(&config),
            vec![Strategy::CapabilityFlag, Strategy::InterfaceNames]
        );
    }

    #[test]
    fn test_flag_positive_with_enumeration_failure() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&[]));
        probe.set_flag(Scripted::Value(true));
        probe.fail_enumeration();
        let detector = detector(probe);

        assert!(detector.detect());
        assert_eq!(detector.detect_info(), TunnelInfo::connected(None, None));
    }

    #[test]
    fn test_flag_short_circuits_detect() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&["eth0", "tun0"]));
        probe.set_flag(Scripted::Value(true));
        let detector = detector(probe.clone());

        assert!(detector.detect());
        assert_eq!(probe.enumerations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_detect_info_enriches_early_positive() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&["eth0", "wg0"]));
        probe.set_status(Scripted::Value(Some(VpnProfileStatus::Connected)));
        let info = detector(probe).detect_info();

        assert_eq!(
            info,
            TunnelInfo::connected(Some("wg0".into()), Some("WireGuard".into()))
        );
    }

    #[test]
    fn test_profile_status_not_connected_falls_through() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&["eth0"]));
        probe.set_flag(Scripted::Value(false));
        probe.set_status(Scripted::Value(Some(VpnProfileStatus::Connecting)));
        assert!(!detector(probe.clone()).detect());

        probe.set_status(Scripted::Value(None));
        assert!(!detector(probe).detect());
    }

    #[test]
    fn test_failing_strategies_continue_to_names() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&["en0", "ppp0"]));
        probe.set_flag(Scripted::Fail);
        probe.set_status(Scripted::Fail);
        let detector = detector(probe);

        assert!(detector.detect());
        let info = detector.detect_info();
        assert_eq!(info.interface_name(), Some("ppp0"));
        assert_eq!(info.protocol(), Some("PPP"));
    }

    #[test]
    fn test_everything_fails_is_negative() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&[]));
        probe.set_flag(Scripted::Fail);
        probe.set_status(Scripted::Fail);
        probe.fail_enumeration();
        let detector = detector(probe);

        assert!(!detector.detect());
        assert_eq!(detector.detect_info(), TunnelInfo::disconnected());
    }

    #[test]
    fn test_detect_is_idempotent() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&["lo", "tun0"]));
        let detector = detector(probe);
        assert_eq!(detector.detect(), detector.detect());
        assert_eq!(detector.detect_info(), detector.detect_info());
    }

    #[test]
    fn test_down_interfaces_are_skipped() {
        let probe = Arc::new(ScriptedProbe::with_interfaces(&[]));
        *probe.interfaces.lock().unwrap() = Scripted::Value(vec![
            NetworkInterface::new("eth0", true),
            NetworkInterface::new("tun0", false),
        ]);

        assert!(!detector(probe.clone()).detect());

        let config = DetectionConfig {
            only_active_interfaces: false,
            ..DetectionConfig::default()
        };
        let detector = Detector::new(probe, Arc::new(InterfaceClassifier::default()), &config);
        assert!(detector.detect());
    }

    #[test]
    fn test_probe_platform_selects_ignore_list() {
        let mut probe = ScriptedProbe::with_interfaces(&["en0", "utun1"]);
        probe.platform = Platform::MacOs;
        assert!(!detector(Arc::new(probe)).detect());

        let probe = ScriptedProbe::with_interfaces(&["en0", "utun1"]);
        assert!(detector(Arc::new(probe)).detect());
    }

    #[test]
    fn test_utun_scenario_through_detector() {
        let mut table = PatternTable::empty();
        table.add("tun", Some("TUN/TAP"));
        let classifier = Arc::new(InterfaceClassifier::new(table, HashMap::new()));
        let mut probe = ScriptedProbe::with_interfaces(&["en0", "utun3"]);
        probe.platform = Platform::MacOs;

        let detector = Detector::new(Arc::new(probe), classifier, &DetectionConfig::default());
        assert_eq!(
            detector.detect_info(),
            TunnelInfo::connected(Some("utun3".into()), Some("TUN/TAP".into()))
        );
    }
}
