//! Domain layer: protocol-facing data types, persistent settings, and track
//! definitions. No I/O except settings/track file handling.

pub mod models;
pub mod settings;
pub mod track;
