#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::struct_excessive_bools)]

//! sbdlink library — the SBD modem link driver, exposed for downstream crates
//! and test harnesses.
//!
//! The driver is a two-tier cooperative state machine over one shared serial
//! line:
//! - `protocol` — the middle layer: one command in flight against the modem or
//!   the aux board, line assembly, parsers, timeouts
//! - `api` — the upper layer: workflows (file send with retry, mailbox
//!   polling, signal polling, aux command queue, stuck-link recovery)
//! - `mt` — mobile-terminated message actions and directory routing
//! - `transport` / `clock` / `power` / `hooks` / `spool` — the seams to the
//!   hardware, the wall clock, switched power, the application, and the
//!   message spool
//! - `sim` — in-memory doubles so the whole driver runs on a desktop

pub mod api;
pub mod clock;
pub mod config;
pub mod hooks;
pub mod log;
pub mod mt;
pub mod power;
pub mod protocol;
pub mod sim;
pub mod spool;
pub mod transport;
pub mod util;

// Re-export key types at crate root for convenience.
pub use api::{LinkCommand, LinkState, ModemLink};
pub use config::Config;
pub use protocol::error::ErrorCode;
pub use protocol::{AtState, ProtocolEngine};
pub use transport::{PortRouting, SerialPort};
