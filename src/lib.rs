//! zsync: delta-transfer downloads over plain HTTP range requests.
//!
//! See the top-level design notes in each module; `state::ZsyncState` is
//! the aggregate that owns the signature table, range registry, and
//! scratch file that the matcher and receivers mutate.

pub mod checksum;
pub mod cli;
pub mod controlfetch;
pub mod controlfile;
pub mod error;
pub mod httpfetch;
pub mod logger;
pub mod matcher;
pub mod rangemap;
pub mod receiver;
pub mod scratch;
pub mod sigtable;
pub mod state;
pub mod url;
pub mod zmap;
