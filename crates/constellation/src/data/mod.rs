// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CDTP data streaming: push-side transmitter and pull-side receiver.

mod receiver;
mod transmitter;

pub use receiver::{DataCallbacks, DataReceiver};
pub use transmitter::{DataBlock, DataTransmitter, TransmitterState};
