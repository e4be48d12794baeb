//! SlotLease entity: one live reservation of a gate

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "slot_lease")]
pub struct Model {
    /// Reservation key, `slot/{host}/{port}`
    #[sea_orm(primary_key, auto_increment = false)]
    pub key: String,

    /// Agent currently holding the gate
    pub agent_id: String,

    /// Lease deadline; the row is dead once this has passed
    pub expires_at: ChronoDateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
