// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link-quality harness for the downstream ports of a PCIe switch.
//!
//! A session resolves the buses below a recognized switch, retrains or
//! resets the endpoints found there, and records LTSSM transitions and
//! switch error counters while it does. The result is a correlated,
//! scored report checked against PCIe 6.x timing and error limits.

pub mod assessment;
pub mod counters;
pub mod error;
pub mod host;
pub mod kernel_log;
pub mod ltssm;
pub mod pcie;
pub mod register;
pub mod retrain;
pub mod session;
pub mod topology;

pub use assessment::{Collaborators, QualityReport, QualitySession, SessionConfig};
pub use error::Error;
pub use pcie::Bdf;
