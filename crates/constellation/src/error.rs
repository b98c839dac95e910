// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Crate-wide error types.
//!
//! Each subsystem boundary carries its own error enum; the codec layer
//! distinguishes unknown protocols, protocol mismatches and malformed
//! frames so receivers can apply the correct discard/report policy.

use thiserror::Error;

/// Errors raised while disassembling a received message.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// The protocol identifier is not one this crate speaks.
    #[error("unknown protocol identifier `{0}`")]
    UnknownProtocol(String),
    /// The protocol identifier is known but does not match the reader.
    #[error("unexpected protocol `{got}`, expected `{expected}`")]
    UnexpectedProtocol { got: String, expected: String },
    /// Wrong frame count, wrong type at a field, or a truncated frame.
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl DecodeError {
    pub(crate) fn malformed(what: impl Into<String>) -> Self {
        DecodeError::Malformed(what.into())
    }
}

/// Errors of the CHIRP discovery subsystem.
#[derive(Debug, Error)]
pub enum ChirpError {
    #[error("invalid CHIRP message: {0}")]
    Malformed(String),
    #[error("multicast socket error: {0}")]
    Socket(#[from] std::io::Error),
    #[error("no usable network interface matching {0:?}")]
    NoInterface(Vec<String>),
}

/// Errors of the CSCP control channel.
#[derive(Debug, Error)]
pub enum CscpError {
    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("request `{command}` rejected: {reply}")]
    Rejected { command: String, reply: String },
}

/// Errors of the CDTP data channel.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("no consumer attached within BOR timeout ({0:?})")]
    BorTimeout(std::time::Duration),
    #[error("sending data block timed out ({0:?})")]
    DataTimeout(std::time::Duration),
    #[error("missing EOR from {0} after timeout")]
    EorTimeout(String),
    #[error("data transmitter used in state {0}")]
    WrongState(&'static str),
    #[error("send queue full ({0} blocks)")]
    QueueFull(usize),
    #[error("data transmitters not discovered: {0}")]
    MissingTransmitters(String),
}

/// Errors of the configuration value object.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("key `{0}` does not exist")]
    MissingKey(String),
    #[error("could not convert value of key `{key}` to {target}")]
    InvalidType { key: String, target: &'static str },
    #[error("value of key `{key}` is not valid: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("failed to update value of key `{key}`: {reason}")]
    InvalidUpdate { key: String, reason: String },
    #[error("invalid configuration dictionary: {0}")]
    InvalidDictionary(String),
    #[error("environment variable `{0}` not defined")]
    MissingEnvVariable(String),
}

/// Errors raised by satellite operation, command handling and hooks.
#[derive(Debug, Error)]
pub enum SatelliteError {
    #[error("invalid satellite name: {0}")]
    InvalidName(String),
    #[error("transition `{transition}` not allowed in state {state}")]
    TransitionNotAllowed {
        transition: &'static str,
        state: &'static str,
    },
    #[error("{0}")]
    WrongArgument(String),
    #[error("not implemented: {0}")]
    NotImplemented(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Chirp(#[from] ChirpError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("socket error: {0}")]
    Socket(#[from] zmq::Error),
    #[error("{0}")]
    Failed(String),
}

impl SatelliteError {
    /// Shortcut for hook implementations reporting a plain failure.
    pub fn failed(what: impl Into<String>) -> Self {
        SatelliteError::Failed(what.into())
    }
}
