// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors surfaced by the harness.

use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::pcie::Bdf;
use crate::register::RegisterError;

/// Errors working with the switch, its downstream devices, or a session.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Register(#[from] RegisterError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Invalid value for a PCIe configuration parameter '{parameter}': {value}")]
    InvalidPcieParameter { parameter: &'static str, value: u64 },

    #[error("Invalid bus/device/function string: \"{0}\"")]
    InvalidBdf(String),

    #[error("Invalid vendor:device signature: \"{0}\"")]
    InvalidSignature(String),

    #[error("No switch bridge matching {signatures} was found; refusing to run")]
    SwitchNotFound { signatures: String },

    #[error("No in-scope downstream endpoints were found below the switch")]
    NoTargets,

    #[error("Device {bdf} is not a downstream endpoint of the switch: {reason}")]
    TargetOutOfScope { bdf: Bdf, reason: String },

    #[error("Register access is unavailable: {0}")]
    RegisterAccessUnavailable(String),

    #[error("Failed to run \"{program}\": {reason}")]
    Command { program: String, reason: String },

    #[error("\"{program}\" did not finish within {timeout:?}")]
    CommandTimeout { program: String, timeout: Duration },

    #[error("Switch command channel failed: {0}")]
    CommandChannel(String),

    #[error("Counter response is missing {0}")]
    CounterParse(String),

    #[error("{method} is not supported by {bdf}: {reason}")]
    ResetUnsupported {
        bdf: Bdf,
        method: &'static str,
        reason: String,
    },

    #[error("Sampler is already running")]
    AlreadyRunning,

    #[error("Sampler is not running")]
    NotRunning,

    #[error("Invalid configuration: {0}")]
    Config(String),
}
