//! SQL-backed slot store
//!
//! Every operation is a single conditional statement, so the database's row
//! locking gives the linearizable compare-and-swap the gatekeeper relies on,
//! across any number of server processes sharing the database.

use crate::entities::prelude::SlotLease;
use crate::entities::slot_lease;
use crate::{SlotStore, StoreError, StoreResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, OnConflict};
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use std::time::Duration;
use tracing::trace;

/// Slot store persisted in a SQL database
#[derive(Debug, Clone)]
pub struct SqlSlotStore {
    db: DatabaseConnection,
}

impl SqlSlotStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    /// Connect to `database_url` and run migrations
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let db = crate::connect(database_url).await?;
        crate::migrate(&db).await?;
        Ok(Self::new(db))
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Delete rows whose lease has run out; returns how many were removed
    pub async fn purge_expired(&self) -> StoreResult<u64> {
        let result = SlotLease::delete_many()
            .filter(slot_lease::Column::ExpiresAt.lte(Utc::now()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected)
    }

    fn deadline(ttl: Duration) -> StoreResult<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|_| StoreError::InvalidTtl(ttl))?;
        Ok(Utc::now() + ttl)
    }

    async fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let lease = slot_lease::ActiveModel {
            key: Set(key.to_string()),
            agent_id: Set(value.to_string()),
            expires_at: Set(expires_at),
        };

        let inserted = SlotLease::insert(lease)
            .on_conflict(
                OnConflict::column(slot_lease::Column::Key)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await;

        match inserted {
            Ok(rows) => Ok(rows > 0),
            Err(DbErr::RecordNotInserted) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl SlotStore for SqlSlotStore {
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Duration,
    ) -> StoreResult<bool> {
        let now = Utc::now();
        let expires_at = Self::deadline(ttl)?;

        let swapped = match expected {
            None => {
                if self.insert_if_absent(key, value, expires_at).await? {
                    true
                } else {
                    // Row exists; only a dead lease may be taken over
                    let result = SlotLease::update_many()
                        .col_expr(slot_lease::Column::AgentId, Expr::value(value))
                        .col_expr(slot_lease::Column::ExpiresAt, Expr::value(expires_at))
                        .filter(slot_lease::Column::Key.eq(key))
                        .filter(slot_lease::Column::ExpiresAt.lte(now))
                        .exec(&self.db)
                        .await?;
                    result.rows_affected == 1
                }
            }
            Some(expected) => {
                let result = SlotLease::update_many()
                    .col_expr(slot_lease::Column::AgentId, Expr::value(value))
                    .col_expr(slot_lease::Column::ExpiresAt, Expr::value(expires_at))
                    .filter(slot_lease::Column::Key.eq(key))
                    .filter(slot_lease::Column::AgentId.eq(expected))
                    .filter(slot_lease::Column::ExpiresAt.gt(now))
                    .exec(&self.db)
                    .await?;
                result.rows_affected == 1
            }
        };

        trace!("CAS {} ({:?} -> {}): {}", key, expected, value, swapped);
        Ok(swapped)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> StoreResult<bool> {
        let result = SlotLease::delete_many()
            .filter(slot_lease::Column::Key.eq(key))
            .filter(slot_lease::Column::AgentId.eq(expected))
            .filter(slot_lease::Column::ExpiresAt.gt(Utc::now()))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let lease = SlotLease::find_by_id(key.to_string())
            .filter(slot_lease::Column::ExpiresAt.gt(Utc::now()))
            .one(&self.db)
            .await?;
        Ok(lease.map(|l| l.agent_id))
    }

    async fn renew(&self, key: &str, expected: &str, ttl: Duration) -> StoreResult<bool> {
        let now = Utc::now();
        let result = SlotLease::update_many()
            .col_expr(
                slot_lease::Column::ExpiresAt,
                Expr::value(Self::deadline(ttl)?),
            )
            .filter(slot_lease::Column::Key.eq(key))
            .filter(slot_lease::Column::AgentId.eq(expected))
            .filter(slot_lease::Column::ExpiresAt.gt(now))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected == 1)
    }
}
