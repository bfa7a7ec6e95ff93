//! Types handed to the UI shell.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so hosts can
//! forward them as JSON without re-mapping.

pub mod events;
