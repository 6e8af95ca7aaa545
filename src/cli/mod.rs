//! Operator-facing terminal I/O: the mode prompt and console rendering of
//! flash events.

pub mod console;
pub mod prompt;
