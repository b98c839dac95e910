// SPDX-License-Identifier: Apache-2.0 OR MIT

//! CSCP control channel: request transmitter and command receiver.

mod receiver;
mod transmitter;

pub use receiver::{
    CommandEntry, CommandError, CommandGuard, CommandHandler, CommandReceiver, CommandRegistry,
    CommandReply,
};
pub use transmitter::CommandTransmitter;
