//! Exec buffer management.

mod exec_buffer;

pub use exec_buffer::*;
