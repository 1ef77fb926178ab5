//! CRDT building blocks: observed-remove sets and last-write-wins registers.
//!
//! Both types are pure semilattices — `merge` is commutative, associative,
//! and idempotent — which is what lets [`crate::reducer`] fold patches from
//! any arrival order into bit-identical state.

pub mod lww;
pub mod orset;

pub use lww::LwwRegister;
pub use orset::OrSet;
