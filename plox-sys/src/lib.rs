//! The plox virtual machine: an interpreter for pre-compiled Lox program
//! images.
//!
//! The library is split the way execution flows: `program` loads and
//! validates an image into a read-only model, `vm` interprets it against an
//! operand stack and a bounded call stack, `core` supplies the native
//! function registry, and `reporting` renders the terminal diagnostic when a
//! runtime error halts everything.

pub mod core;
pub mod program;
pub mod reporting;
pub mod vm;

pub(crate) mod trace;
