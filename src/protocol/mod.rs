//! Protocol numbers and wire formats the interface layer depends on.
//!
//! Network and transport protocol engines live outside this crate; only the
//! constants and the NDP message formats needed to drive an interface are
//! defined here.

pub mod icmpv6;
pub mod types;

pub use types::*;
