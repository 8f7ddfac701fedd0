//! Fintech back-end core: accounts, deposits, withdrawals, and
//! cross-currency transfers coordinated as event chains over the bus.
//!
//! Each financial operation is a directed chain of events with one terminal
//! success event and one terminal failure event. Handlers never call each
//! other directly; the bus is the only coupling between stages.

pub mod commands;
pub mod config;
pub mod db;
pub mod domain;
pub mod events;
pub mod providers;
pub mod repos;
pub mod workflows;

pub use commands::{CommandDispatcher, CommandError, FlowAck};
pub use config::{BusKind, Config};
pub use events::FlowEvent;
