// crates/challengectl-store-sqlite/src/lib.rs
// ============================================================================
// Crate: challengectl-store-sqlite
// Description: SQLite-backed implementation of the `DurableStore` trait.
// Purpose: Give the dispatch core and control plane API a concrete,
//          single-writer, immediate-transaction durable store without
//          exposing connection or transaction types.
// Dependencies: challengectl-core, rusqlite
// ============================================================================

//! ## Overview
//! See [`store`] for the implementation. The crate exposes exactly one
//! public type, [`SqliteDurableStore`], implementing
//! [`challengectl_core::DurableStore`].

mod store;

pub use store::SqliteDurableStore;
pub use store::SqliteStoreError;
