// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Kernel log snapshots and link-training line classification.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::Error;
use crate::host::{command_stdout, HostCommandSpec, DEFAULT_COMMAND_TIMEOUT};
use crate::ltssm::LtssmState;
use crate::pcie::Bdf;

/// One kernel log line with its wall-clock timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KernelLine {
    pub timestamp: DateTime<Utc>,
    pub text: String,
}

/// A finite snapshot of recent kernel log lines.
pub trait LogQuery: Send + Sync {
    fn recent_kernel_lines(&self, since: Option<DateTime<Utc>>) -> Result<Vec<KernelLine>, Error>;
}

/// Reads the kernel ring buffer with `dmesg --time-format=iso`.
#[derive(Debug, Clone)]
pub struct DmesgLogQuery {
    timeout: Duration,
}

impl DmesgLogQuery {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for DmesgLogQuery {
    fn default() -> Self {
        Self::new()
    }
}

impl LogQuery for DmesgLogQuery {
    fn recent_kernel_lines(&self, since: Option<DateTime<Utc>>) -> Result<Vec<KernelLine>, Error> {
        let out = command_stdout(
            HostCommandSpec::new("dmesg", &["--time-format=iso"]).with_timeout(self.timeout),
        )?;
        Ok(parse_iso_dmesg(&out)
            .into_iter()
            .filter(|line| since.map_or(true, |since| line.timestamp >= since))
            .collect())
    }
}

/// Parse `dmesg --time-format=iso` output, e.g.
/// `2024-05-01T10:11:12,345678+00:00 pcieport 0000:02:00.0: ...`.
/// Lines without a parseable timestamp are dropped.
pub fn parse_iso_dmesg(text: &str) -> Vec<KernelLine> {
    text.lines()
        .filter_map(|line| {
            let (stamp, rest) = line.split_once(' ')?;
            let stamp = stamp.replacen(',', ".", 1);
            let timestamp = DateTime::parse_from_rfc3339(&stamp).ok()?;
            Some(KernelLine {
                timestamp: timestamp.with_timezone(&Utc),
                text: rest.trim().to_string(),
            })
        })
        .collect()
}

/// A link-related kernel message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkEvent {
    HotReset,
    Disabled,
    Retrain,
    Down,
    Up,
    BusError,
}

impl LinkEvent {
    /// The training state a message implies, if any.
    pub fn implied_state(&self) -> Option<LtssmState> {
        match self {
            LinkEvent::HotReset => Some(LtssmState::HotReset),
            LinkEvent::Disabled => Some(LtssmState::Disabled),
            LinkEvent::Retrain => Some(LtssmState::Recovery),
            LinkEvent::Down => Some(LtssmState::Detect),
            LinkEvent::Up => Some(LtssmState::L0),
            LinkEvent::BusError => None,
        }
    }
}

// Checked in order; the first match wins.
const LINK_PATTERNS: &[(LinkEvent, &str)] = &[
    (LinkEvent::HotReset, r"(?i)hot[ _-]?reset|secondary bus reset"),
    (LinkEvent::Disabled, r"(?i)link (?:is )?disabled"),
    (LinkEvent::Retrain, r"(?i)retrain"),
    (
        LinkEvent::Down,
        r"(?i)link (?:is )?down|card not present|Data Link Layer Link Active not set",
    ),
    (LinkEvent::Up, r"(?i)link (?:is )?up\b|Data Link Layer Link Active set|link training complete"),
    (LinkEvent::BusError, r"(?i)PCIe Bus Error|\bAER\b"),
];

fn link_patterns() -> &'static [(LinkEvent, Regex)] {
    static PATTERNS: OnceLock<Vec<(LinkEvent, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        LINK_PATTERNS
            .iter()
            .filter_map(|(event, pattern)| Some((*event, Regex::new(pattern).ok()?)))
            .collect()
    })
}

/// Classify one kernel message.
pub fn classify(text: &str) -> Option<LinkEvent> {
    link_patterns()
        .iter()
        .find(|(_, re)| re.is_match(text))
        .map(|(event, _)| *event)
}

/// True if `text` names `bdf`, in either the full or short address form.
/// The short `bus:dev.fn` form only names devices in domain 0.
pub fn mentions(text: &str, bdf: &Bdf) -> bool {
    let full = bdf.to_string();
    if text.contains(&full) {
        return true;
    }
    if bdf.domain != 0 {
        return false;
    }
    // Part of a full address in some other domain.
    let short = &full[5..];
    text.match_indices(short)
        .any(|(at, _)| !text[..at].ends_with(|c: char| c == ':' || c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
2024-05-01T10:11:12,345678+00:00 pcieport 0000:02:00.0: pciehp: Slot(3): Link Down
2024-05-01T10:11:12,845678+00:00 pcieport 0000:02:00.0: pciehp: Slot(3): Link Up
garbage without a timestamp
2024-05-01T10:11:13,000000+00:00 nvme 0000:03:00.0: PCIe Bus Error: severity=Corrected
";

    #[test]
    fn parses_iso_timestamps() {
        let lines = parse_iso_dmesg(SAMPLE);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].timestamp.timestamp_subsec_micros(), 345678);
        assert!(lines[0].text.starts_with("pcieport"));
    }

    #[test]
    fn classifies_link_messages() {
        let lines = parse_iso_dmesg(SAMPLE);
        assert_eq!(classify(&lines[0].text), Some(LinkEvent::Down));
        assert_eq!(classify(&lines[1].text), Some(LinkEvent::Up));
        assert_eq!(classify(&lines[2].text), Some(LinkEvent::BusError));
        assert_eq!(classify("pcieport 0000:02:00.0: retraining link"), Some(LinkEvent::Retrain));
        assert_eq!(classify("usb 1-1: new high-speed USB device"), None);
    }

    #[test]
    fn matches_short_and_full_addresses() {
        let bdf = Bdf::new(0, 3, 0, 0);
        assert!(mentions("nvme 0000:03:00.0: ready", &bdf));
        assert!(mentions("pci 03:00.0 link up", &bdf));
        assert!(!mentions("pci 0000:04:00.0 link up", &bdf));
    }

    #[test]
    fn short_address_only_names_domain_zero() {
        let bdf = Bdf::new(0, 3, 0, 0);
        assert!(!mentions("nvme 0001:03:00.0: link down", &bdf));
        assert!(mentions("nvme 0001:03:00.0 and 03:00.0: link down", &bdf));

        let elsewhere = Bdf::new(1, 3, 0, 0);
        assert!(mentions("nvme 0001:03:00.0: link down", &elsewhere));
        assert!(!mentions("pci 03:00.0 link up", &elsewhere));
        assert!(!mentions("nvme 0000:03:00.0: link down", &elsewhere));
    }
}
