//! seratosync-core: mirror a music folder tree into Serato crates
//!
//! This crate provides byte-exact read/write support for:
//! - `database V2` (track records) - big-endian TLV
//! - `Subcrates/*.crate` (track path lists) - big-endian TLV
//!
//! plus prefix inference between stored and scanned paths, and an idempotent
//! sync planner that only rewrites crates whose bytes change.

pub mod cleanup;
pub mod crate_file;
pub mod database;
pub mod diagnostics;
pub mod error;
pub mod library;
pub mod prefix;
pub mod string;
pub mod sync;
pub mod tlv;
pub mod track;

pub use diagnostics::Diagnostics;
pub use error::{Error, Result};
pub use sync::{CrateAction, SyncOptions, SyncReport};
pub use track::{FieldValue, TrackRecord};
