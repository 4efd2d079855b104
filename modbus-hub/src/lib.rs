//! Modbus hubs based on [tokio-modbus](https://github.com/slowtec/tokio-modbus).

//! ## Hubs
//!
//! A hub is one configured Modbus endpoint, built by [`hub::ModbusHub::new`] from a
//! [`config::HubConfig`]:
//!
//! - [`client::ClientHub`] talks to a device over serial RTU, TCP, UDP or RTU-over-TCP, one
//!   transaction at a time, and
//! - [`server::ServerHub`] is a virtual slave serving Modbus TCP masters from values registered by
//!   the host application.
//!
//! [`hub::HubRegistry`] keeps the hubs of an installation by name.
//!
//! ## Registers
//!
//! [`codec::build_registers`] encodes a state into big-endian register words for a
//! [`codec::DataType`]:
//! - `int` and `uint` over 1, 2 or 4 registers; signed values out of range are rejected,
//!   unsigned ones wrap,
//! - `float` over 1, 2 or 4 registers as IEEE-754 half, single or double precision,
//! - `string` over `count` registers, two ASCII characters per register.
//!
//! The `"unavailable"` state encodes as zeros, or spaces for strings.
//!
//! A virtual slave folds every [`registers::RegisterEntry`] into one sparse map per unit with
//! [`registers::build_server_blocks`]. The first entry claiming a register, or a bit of it when a
//! bit mask is given, keeps it; later claims are logged and dropped.
//!
//! See `examples/` for simple usage.

/// Utilities for encoding to and decoding from Modbus registers
pub mod codec;
pub mod config;
pub mod error;
pub mod logging;
/// Sparse register blocks and the virtual slave address space builder
pub mod registers;
/// Physical links used by client hubs
pub mod transport;

pub mod client;
pub mod hub;
pub mod server;

pub use error::{HubError, Result};
pub use hub::{CallResponse, CallType, HubRegistry, ModbusHub, Transaction};
