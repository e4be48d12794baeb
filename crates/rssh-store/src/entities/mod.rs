//! Database entities

pub mod prelude;
pub mod slot_lease;
