pub use super::slot_lease::Entity as SlotLease;
