//! Storage layer for entity-audit
//!
//! - `file_io`: JSON files with atomic writes, used for settings.
//! - `memory`: an in-memory persistence layer implementing the unit-of-work
//!   contract, used by tests and the demo command.

pub mod file_io;
pub mod memory;

pub use file_io::{read_json, write_json_atomic};
pub use memory::{EntitySchema, MemorySession, MemoryStore, MemoryTransaction, Row};
