// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CHP heartbeat publication and checking.

mod checker;
mod sender;

pub use checker::{HeartbeatChecker, InterruptCallback, HB_INIT_INTERVAL_MS, HB_INIT_LIVES};
pub use sender::{HeartbeatSender, DEFAULT_HEARTBEAT_PERIOD_MS};
