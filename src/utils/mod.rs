//! Generic utility primitives with zero domain knowledge.
//!
//! - `hash` - Content hashing
//! - `io` - File I/O with consistent error handling

pub mod hash;
pub mod io;
