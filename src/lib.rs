#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

/// The command line interface.
pub mod cli;

/// Relates to config files.
pub mod config;

/// The device command client.
///
/// Owns the command connection, the command queue and the
/// digital-line caches. Everything else talks to it through a
/// [`controller::ControllerHandle`].
pub mod controller;

/// The encoder polling loop.
///
/// Round-robins over the configured encoder channels and decodes the
/// Gray-coded readings arriving on the UART tunnel.
pub mod encoder;

/// Possible errors in this library.
pub mod error;

/// Logging/tracing setup.
pub mod logging;

/// Declarative per-line modes and the corrective actions they imply.
pub mod modes;

/// Framing and classification of the device's line protocol.
pub mod protocol;

/// The UART tunnel carried over the device's second TCP port.
pub(crate) mod uart;
