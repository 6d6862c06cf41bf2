//! Job audit trail
//!
//! Every job appends events to a JSON-lines file. Each event carries the
//! SHA-256 hash of its predecessor, so edits or deletions inside the file
//! are detected by [`verify_chain`].
//!
//! The logger is an explicit object created at job start and handed to the
//! components that emit events.

pub mod logger;
pub mod machine_id;
pub mod types;

pub use logger::{verify_chain, AuditLogger, ChainReport, JsonlAuditLogger};
pub use machine_id::get_machine_id;
pub use types::{AuditEvent, EventType};
