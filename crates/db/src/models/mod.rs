//! Database models for boards, lists and cards.
//!
//! Each entity has one repository exposing exactly the queries the service
//! layer needs. Repositories borrow a `SqliteConnection`, so the same calls
//! work on a pooled connection for plain reads and inside a
//! [`UnitOfWork`](crate::store::UnitOfWork) for locked reads and writes.
//! Children always reference parents by id; there are no implicit joins
//! beyond the live-parent checks spelled out in each query.

pub mod activity;
pub mod board;
pub mod card;
pub mod label;
pub mod list;

use uuid::Uuid;

/// Mint an opaque public identifier such as `crd_3f2a...`.
pub fn new_public_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}
