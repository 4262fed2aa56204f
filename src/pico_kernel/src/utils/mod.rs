//! Utility types shared across the kernel.
//!
//! **This module is exempt from the API stability guarantee** — it's exposed
//! only because it's needed by [`build_kernel!`](crate::build_kernel).
mod init;
pub(crate) mod prio_bitmap;
mod rawcell;

pub use self::{init::Init, rawcell::RawCell};
