//! Mach-O file format handling.
//!
//! Only the header and load commands are decoded: enough to identify a
//! dylib, list its segments and dependencies, and find its UUID. Images may
//! live inside a shared cache or in a standalone (thin or fat) file.

mod constants;
mod context;
mod file;
mod structs;

pub use constants::*;
pub use context::*;
pub use file::*;
pub use structs::*;
