//! Destination file I/O.
//!
//! One shared handle per task, created at its final size, written with
//! positioned writes from many workers at once. Sizing is sparse-first with
//! a best-effort block reservation on Linux.

mod writer;

pub use writer::FileWriter;
