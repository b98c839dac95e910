// SPDX-License-Identifier: Apache-2.0 OR MIT

//! # Constellation - distributed control and data acquisition
//!
//! A framework for small-to-medium scientific instruments: independent
//! "satellite" processes announce themselves via UDP multicast, expose a
//! ZeroMQ control surface with a per-process state machine, publish
//! heartbeats, distribute logs and metrics over topic-filtered pub/sub,
//! and stream run-framed binary data from producers to consumers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use constellation::{CanonicalName, Satellite, SatelliteOptions};
//!
//! struct Photodiode;
//! impl constellation::SatelliteHooks for Photodiode {}
//!
//! fn main() -> Result<(), constellation::SatelliteError> {
//!     let name = CanonicalName::new("Photodiode", "pd01")?;
//!     let options = SatelliteOptions::new(name, "edda");
//!     let mut satellite = Satellite::new(options, Box::new(Photodiode))?;
//!     satellite.run();
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! +--------------------------------------------------------------------+
//! |                        Satellite / Controller                      |
//! |        FSM | command registry | hooks | task handler               |
//! +--------------------------------------------------------------------+
//! |                          Protocol Layer                            |
//! |   CSCP (control) | CHP (heartbeat) | CMDP (monitoring) | CDTP (data)|
//! +--------------------------------------------------------------------+
//! |                          Discovery Layer                           |
//! |              CHIRP beacon + offered/discovered tables              |
//! +--------------------------------------------------------------------+
//! |                          Transport Layer                           |
//! |            UDP multicast | ZeroMQ REQ/REP, XPUB/SUB, PUSH/PULL     |
//! +--------------------------------------------------------------------+
//! ```
//!
//! ## Key Types
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Satellite`] | One control/data-acquisition process |
//! | [`SatelliteHooks`] | Device-specific transition and run behaviour |
//! | [`Controller`] | Discovers and commands an array of satellites |
//! | [`ChirpManager`] | Multicast service discovery |
//! | [`Configuration`] | Validated, usage-tracked configuration values |

/// CHIRP multicast service discovery.
pub mod chirp;
/// Configuration value object.
pub mod config;
/// CSCP control channel.
pub mod control;
/// Controller composition.
pub mod controller;
/// CDTP data streaming.
pub mod data;
/// Crate error types.
pub mod error;
/// The satellite finite state machine.
pub mod fsm;
/// CHP heartbeat publication and checking.
pub mod heartbeat;
/// Host and group identities.
pub mod identity;
/// CMDP monitoring distribution.
pub mod monitoring;
/// Wire codecs for the protocol family.
pub mod protocol;
/// Satellite composition.
pub mod satellite;
/// Network transport helpers.
pub mod transport;

pub use chirp::{ChirpManager, DiscoveredService, ServiceId};
pub use config::Configuration;
pub use controller::{CommandTarget, Controller, ControllerState, RunConfiguration};
pub use error::{ChirpError, ConfigError, CscpError, DataError, DecodeError, SatelliteError};
pub use fsm::{SatelliteFsm, SatelliteState, Transition};
pub use identity::{CanonicalName, Uuid};
pub use protocol::value::{Map, Value};
pub use satellite::{DataRole, RunContext, Satellite, SatelliteHooks, SatelliteOptions};

/// Constellation version string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
