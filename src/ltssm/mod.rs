// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link Training and Status State Machine observation.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::fmt;

use crate::pcie::Bdf;

mod sources;
mod tracker;

pub use sources::{
    parse_lnksta, state_from_link_status, LspciStateSource, RegisterStateSource, StateSource,
    SysfsStateSource, DEFAULT_LTSSM_ATTRIBUTE,
};
pub use tracker::{sample_chain, LtssmTracker};

/// PCIe LTSSM states. Sources that only know the major state report the
/// bare major variant (`Recovery`, `Detect`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LtssmState {
    Detect,
    DetectQuiet,
    DetectActive,
    Polling,
    PollingActive,
    PollingCompliance,
    PollingConfiguration,
    Configuration,
    ConfigurationLinkwidthStart,
    ConfigurationLinkwidthAccept,
    ConfigurationLanenumWait,
    ConfigurationLanenumAccept,
    ConfigurationComplete,
    ConfigurationIdle,
    Recovery,
    RecoveryRcvrLock,
    RecoveryEqualization,
    RecoverySpeed,
    RecoveryRcvrCfg,
    RecoveryIdle,
    L0,
    L0s,
    L1,
    L1Entry,
    L1Idle,
    L2,
    L2Idle,
    L2TransmitWake,
    Disabled,
    Loopback,
    LoopbackEntry,
    LoopbackActive,
    LoopbackExit,
    HotReset,
    /// Never determined. Not a training state.
    #[default]
    Unknown,
}

const STATE_NAMES: &[(LtssmState, &str)] = &[
    (LtssmState::Detect, "Detect"),
    (LtssmState::DetectQuiet, "Detect.Quiet"),
    (LtssmState::DetectActive, "Detect.Active"),
    (LtssmState::Polling, "Polling"),
    (LtssmState::PollingActive, "Polling.Active"),
    (LtssmState::PollingCompliance, "Polling.Compliance"),
    (LtssmState::PollingConfiguration, "Polling.Configuration"),
    (LtssmState::Configuration, "Configuration"),
    (LtssmState::ConfigurationLinkwidthStart, "Configuration.Linkwidth.Start"),
    (LtssmState::ConfigurationLinkwidthAccept, "Configuration.Linkwidth.Accept"),
    (LtssmState::ConfigurationLanenumWait, "Configuration.Lanenum.Wait"),
    (LtssmState::ConfigurationLanenumAccept, "Configuration.Lanenum.Accept"),
    (LtssmState::ConfigurationComplete, "Configuration.Complete"),
    (LtssmState::ConfigurationIdle, "Configuration.Idle"),
    (LtssmState::Recovery, "Recovery"),
    (LtssmState::RecoveryRcvrLock, "Recovery.RcvrLock"),
    (LtssmState::RecoveryEqualization, "Recovery.Equalization"),
    (LtssmState::RecoverySpeed, "Recovery.Speed"),
    (LtssmState::RecoveryRcvrCfg, "Recovery.RcvrCfg"),
    (LtssmState::RecoveryIdle, "Recovery.Idle"),
    (LtssmState::L0, "L0"),
    (LtssmState::L0s, "L0s"),
    (LtssmState::L1, "L1"),
    (LtssmState::L1Entry, "L1.Entry"),
    (LtssmState::L1Idle, "L1.Idle"),
    (LtssmState::L2, "L2"),
    (LtssmState::L2Idle, "L2.Idle"),
    (LtssmState::L2TransmitWake, "L2.TransmitWake"),
    (LtssmState::Disabled, "Disabled"),
    (LtssmState::Loopback, "Loopback"),
    (LtssmState::LoopbackEntry, "Loopback.Entry"),
    (LtssmState::LoopbackActive, "Loopback.Active"),
    (LtssmState::LoopbackExit, "Loopback.Exit"),
    (LtssmState::HotReset, "Hot Reset"),
    (LtssmState::Unknown, "Unknown"),
];

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

impl LtssmState {
    pub fn name(&self) -> &'static str {
        STATE_NAMES
            .iter()
            .find(|(state, _)| state == self)
            .map(|(_, name)| *name)
            .unwrap_or("Unknown")
    }

    /// Parse a state name, ignoring case and separators
    /// (`recovery.rcvrlock`, `RECOVERY_RCVRLOCK`, `Hot Reset`). Text that
    /// names no state yields `Unknown`.
    pub fn parse(text: &str) -> LtssmState {
        let lookup = |candidate: &str| {
            let key = squash(candidate);
            STATE_NAMES
                .iter()
                .find(|(_, name)| squash(name) == key)
                .map(|(state, _)| *state)
        };
        let text = text.trim();
        lookup(text)
            .or_else(|| text.split_whitespace().next().and_then(lookup))
            .unwrap_or(LtssmState::Unknown)
    }

    /// The link is trained and usable.
    pub fn is_link_up(&self) -> bool {
        use LtssmState::*;
        matches!(self, L0 | L0s | L1 | L1Entry | L1Idle)
    }

    pub fn is_recovery(&self) -> bool {
        use LtssmState::*;
        matches!(
            self,
            Recovery | RecoveryRcvrLock | RecoveryEqualization | RecoverySpeed | RecoveryRcvrCfg
                | RecoveryIdle
        )
    }

    /// The link left, or is outside, normal operation.
    pub fn is_disruptive(&self) -> bool {
        use LtssmState::*;
        !matches!(self, Unknown | L2 | L2Idle | L2TransmitWake) && !self.is_link_up()
    }

    /// Link down rather than merely retraining.
    pub fn is_link_down(&self) -> bool {
        use LtssmState::*;
        matches!(self, Detect | DetectQuiet | DetectActive | Disabled)
    }
}

impl fmt::Display for LtssmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for LtssmState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// Where a state observation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    KernelLog,
    Sysfs,
    RegisterPoll,
    ToolQuery,
}

/// One observed state change. Never modified once recorded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LtssmTransition {
    pub timestamp: DateTime<Utc>,
    pub device: Bdf,
    pub source: ObservationSource,
    pub from: LtssmState,
    pub to: LtssmState,
    /// Time spent in `from`, when known.
    pub duration_ms: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip_through_parse() {
        for (state, name) in STATE_NAMES {
            assert_eq!(LtssmState::parse(name), *state, "{name}");
        }
    }

    #[test]
    fn parse_tolerates_spelling_variants() {
        assert_eq!(LtssmState::parse("RECOVERY_RCVRLOCK"), LtssmState::RecoveryRcvrLock);
        assert_eq!(LtssmState::parse("hotreset"), LtssmState::HotReset);
        assert_eq!(LtssmState::parse("L0 (0x11)\n"), LtssmState::L0);
        assert_eq!(LtssmState::parse("garbage"), LtssmState::Unknown);
    }

    #[test]
    fn unknown_is_default_and_not_disruptive() {
        assert_eq!(LtssmState::default(), LtssmState::Unknown);
        assert!(!LtssmState::Unknown.is_disruptive());
        assert!(!LtssmState::Unknown.is_link_up());
        assert!(LtssmState::RecoverySpeed.is_disruptive());
        assert!(LtssmState::RecoverySpeed.is_recovery());
        assert!(!LtssmState::L0s.is_disruptive());
    }
}
