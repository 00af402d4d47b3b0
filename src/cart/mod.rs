//! Offline-first cart: data model, pure reducer, optimistic state machine
//! and server reconciliation.

pub mod machine;
pub mod model;
pub mod reconcile;
pub mod reducer;

pub use machine::{CartMachine, CommitOutcome, PendingCommit};
pub use model::{CartItem, CartState, ItemId, OrderRef, OrderStatus, Totals};
