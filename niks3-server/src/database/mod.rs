//! The ledger: the relational source of truth for closures, objects, and
//! their pending state.
//!
//! Modeled after the teacher's `AtticDatabase` trait (a thin extension
//! trait over `DatabaseConnection`), but the operation set is entirely
//! new — this ledger tracks whole-object reachability and tombstone
//! lifecycle rather than cache/NAR/chunk dedup.

pub mod entity;
pub mod migration;

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue::Set, ConnectionTrait, DatabaseConnection, QuerySelect, TransactionTrait,
};

use crate::error::{ServerError, ServerResult};
use entity::closure::{self, Entity as Closure};
use entity::multipart_upload::{self, Entity as MultipartUpload};
use entity::object::{self, Entity as Object, ObjectModel};
use entity::pending_closure::{self, Entity as PendingClosure, PendingClosureModel};
use entity::pending_object::{self, Entity as PendingObject, PendingObjectModel};
use entity::pin::{self, Entity as Pin};
use entity::Json;

/// An object key and the refs it will carry, staged for
/// `InsertPendingObjects`.
#[derive(Debug, Clone)]
pub struct NewPendingObject {
    pub key: String,
    pub refs: Vec<String>,
}

/// The tombstone state of a key already present in the ledger, as
/// returned by `FindExistingObjects`.
#[derive(Debug, Clone)]
pub struct ExistingObject {
    pub key: String,
    pub tombstone_age: Option<Duration>,
}

/// Outcome of `CleanupPendingClosures`.
#[derive(Debug, Clone, Default)]
pub struct CleanupOutcome {
    pub pending_closures_removed: u64,
    /// Upload IDs belonging to the removed pending closures, so the
    /// caller can cross-check against what it already aborted via
    /// `GetOldMultipartUploads`.
    pub multipart_upload_ids: Vec<String>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn begin_pending_closure(&self, narinfo_key: &str) -> ServerResult<PendingClosureModel>;

    async fn find_existing_objects(&self, keys: &[String]) -> ServerResult<Vec<ExistingObject>>;

    async fn insert_pending_objects(
        &self,
        pending_closure_id: i64,
        rows: &[NewPendingObject],
    ) -> ServerResult<()>;

    async fn insert_multipart_upload(
        &self,
        pending_closure_id: i64,
        object_key: &str,
        upload_id: &str,
    ) -> ServerResult<()>;

    /// Lists the Pending Objects staged under a pending closure, used by
    /// the protocol's commit phase to validate that a posted narinfo key
    /// actually belongs to the closure being completed.
    async fn list_pending_objects(
        &self,
        pending_closure_id: i64,
    ) -> ServerResult<Vec<PendingObjectModel>>;

    async fn commit_pending_closure(&self, pending_closure_id: i64) -> ServerResult<()>;

    async fn get_closure(&self, narinfo_key: &str) -> ServerResult<closure::Model>;

    async fn get_closure_objects(&self, narinfo_key: &str) -> ServerResult<Vec<ObjectModel>>;

    async fn delete_old_closures(&self, cutoff: DateTime<Utc>) -> ServerResult<u64>;

    async fn mark_stale_objects(&self) -> ServerResult<u64>;

    async fn get_objects_ready_for_deletion(
        &self,
        grace_period: Duration,
        limit: u64,
    ) -> ServerResult<Vec<String>>;

    async fn mark_objects_as_active(&self, keys: &[String]) -> ServerResult<()>;

    async fn delete_objects(&self, keys: &[String]) -> ServerResult<u64>;

    async fn cleanup_pending_closures(&self, seconds_old: i64) -> ServerResult<CleanupOutcome>;

    /// Returns `(object_key, upload_id)` pairs whose parent pending
    /// closure is past `seconds_old`, for explicit S3 abort ahead of the
    /// cascade delete `cleanup_pending_closures` performs.
    async fn get_old_multipart_uploads(&self, seconds_old: i64) -> ServerResult<Vec<(String, String)>>;

    /// Reclaims space and refreshes planner statistics on the five
    /// tables the GC loop mutates. A no-op on engines with no
    /// equivalent online maintenance command.
    async fn vacuum(&self) -> ServerResult<()>;
}

#[async_trait]
impl Ledger for DatabaseConnection {
    async fn begin_pending_closure(&self, narinfo_key: &str) -> ServerResult<PendingClosureModel> {
        if !narinfo_key.ends_with(".narinfo") {
            return Err(ServerError::MalformedRequest(format!(
                "closure key {} does not end in .narinfo",
                narinfo_key
            )));
        }

        let now = Utc::now();
        let active = pending_closure::ActiveModel {
            id: Default::default(),
            key: Set(narinfo_key.to_owned()),
            started_at: Set(now),
        };

        active
            .insert(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn find_existing_objects(&self, keys: &[String]) -> ServerResult<Vec<ExistingObject>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let now = Utc::now();
        let rows = Object::find()
            .filter(object::Column::Key.is_in(keys.to_vec()))
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let tombstone_age = row.first_deleted_at.and_then(|first_deleted_at| {
                    row.deleted_at
                        .map(|_| (now - first_deleted_at).to_std().unwrap_or(Duration::ZERO))
                });

                ExistingObject {
                    key: row.key,
                    tombstone_age,
                }
            })
            .collect())
    }

    async fn insert_pending_objects(
        &self,
        pending_closure_id: i64,
        rows: &[NewPendingObject],
    ) -> ServerResult<()> {
        if rows.is_empty() {
            return Ok(());
        }

        let actives = rows.iter().map(|row| pending_object::ActiveModel {
            id: Default::default(),
            pending_closure_id: Set(pending_closure_id),
            key: Set(row.key.clone()),
            refs: Set(Json(row.refs.clone())),
        });

        PendingObject::insert_many(actives)
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn insert_multipart_upload(
        &self,
        pending_closure_id: i64,
        object_key: &str,
        upload_id: &str,
    ) -> ServerResult<()> {
        let active = multipart_upload::ActiveModel {
            id: Default::default(),
            pending_closure_id: Set(pending_closure_id),
            object_key: Set(object_key.to_owned()),
            upload_id: Set(upload_id.to_owned()),
        };

        active
            .insert(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn list_pending_objects(
        &self,
        pending_closure_id: i64,
    ) -> ServerResult<Vec<PendingObjectModel>> {
        PendingObject::find()
            .filter(pending_object::Column::PendingClosureId.eq(pending_closure_id))
            .all(self)
            .await
            .map_err(ServerError::database_error)
    }

    async fn commit_pending_closure(&self, pending_closure_id: i64) -> ServerResult<()> {
        self.transaction::<_, (), ServerError>(|txn| {
            Box::pin(async move {
                let pending_closure = PendingClosure::find_by_id(pending_closure_id)
                    .one(txn)
                    .await
                    .map_err(ServerError::database_error)?
                    .ok_or(ServerError::NoSuchPendingClosure {
                        id: pending_closure_id,
                    })?;

                let now = Utc::now();

                upsert_closure(txn, &pending_closure.key, now).await?;

                let pending_objects = PendingObject::find()
                    .filter(pending_object::Column::PendingClosureId.eq(pending_closure_id))
                    .all(txn)
                    .await
                    .map_err(ServerError::database_error)?;

                for pending in pending_objects {
                    upsert_object(txn, &pending.key, pending.refs.0).await?;
                }

                PendingObject::delete_many()
                    .filter(pending_object::Column::PendingClosureId.eq(pending_closure_id))
                    .exec(txn)
                    .await
                    .map_err(ServerError::database_error)?;

                PendingClosure::delete_by_id(pending_closure_id)
                    .exec(txn)
                    .await
                    .map_err(ServerError::database_error)?;

                Ok(())
            })
        })
        .await
        .map_err(|e| match e {
            sea_orm::TransactionError::Connection(db_err) => ServerError::database_error(db_err),
            sea_orm::TransactionError::Transaction(server_err) => server_err,
        })
    }

    async fn get_closure(&self, narinfo_key: &str) -> ServerResult<closure::Model> {
        Closure::find_by_id(narinfo_key.to_owned())
            .one(self)
            .await
            .map_err(ServerError::database_error)?
            .ok_or_else(|| ServerError::NoSuchClosure {
                key: narinfo_key.to_owned(),
            })
    }

    async fn get_closure_objects(&self, narinfo_key: &str) -> ServerResult<Vec<ObjectModel>> {
        self.get_closure(narinfo_key).await?;
        bfs_reachable(self, &[narinfo_key.to_owned()]).await
    }

    async fn delete_old_closures(&self, cutoff: DateTime<Utc>) -> ServerResult<u64> {
        let pinned = sea_orm::sea_query::Query::select()
            .column(pin::Column::NarinfoKey)
            .from(Pin)
            .to_owned();

        let result = Closure::delete_many()
            .filter(closure::Column::UpdatedAt.lt(cutoff))
            .filter(closure::Column::Key.not_in_subquery(pinned))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(result.rows_affected)
    }

    async fn mark_stale_objects(&self) -> ServerResult<u64> {
        let roots: Vec<String> = Closure::find()
            .select_only()
            .column(closure::Column::Key)
            .into_tuple()
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        let reachable = bfs_reachable(self, &roots).await?;
        let reachable_keys: HashSet<String> = reachable.into_iter().map(|o| o.key).collect();

        let pending_keys: HashSet<String> = PendingObject::find()
            .select_only()
            .column(pending_object::Column::Key)
            .into_tuple::<String>()
            .all(self)
            .await
            .map_err(ServerError::database_error)?
            .into_iter()
            .collect();

        let live_objects = Object::find()
            .filter(object::Column::DeletedAt.is_null())
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        let now = Utc::now();
        let mut marked = 0u64;

        for row in live_objects {
            if reachable_keys.contains(&row.key) || pending_keys.contains(&row.key) {
                continue;
            }

            let first_deleted_at = row.first_deleted_at.unwrap_or(now);
            let active = object::ActiveModel {
                key: Set(row.key),
                refs: Set(row.refs),
                deleted_at: Set(Some(now)),
                first_deleted_at: Set(Some(first_deleted_at)),
            };

            active
                .update(self)
                .await
                .map_err(ServerError::database_error)?;

            marked += 1;
        }

        Ok(marked)
    }

    async fn get_objects_ready_for_deletion(
        &self,
        grace_period: Duration,
        limit: u64,
    ) -> ServerResult<Vec<String>> {
        let horizon = Utc::now()
            - chrono::Duration::from_std(grace_period).unwrap_or_else(|_| chrono::Duration::zero());

        let keys = Object::find()
            .select_only()
            .column(object::Column::Key)
            .filter(object::Column::DeletedAt.is_not_null())
            .filter(object::Column::FirstDeletedAt.is_not_null())
            .filter(object::Column::FirstDeletedAt.lte(horizon))
            .limit(limit)
            .into_tuple()
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(keys)
    }

    async fn mark_objects_as_active(&self, keys: &[String]) -> ServerResult<()> {
        if keys.is_empty() {
            return Ok(());
        }

        Object::update_many()
            .col_expr(
                object::Column::DeletedAt,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .filter(object::Column::Key.is_in(keys.to_vec()))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(())
    }

    async fn delete_objects(&self, keys: &[String]) -> ServerResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }

        let result = Object::delete_many()
            .filter(object::Column::Key.is_in(keys.to_vec()))
            .exec(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(result.rows_affected)
    }

    async fn cleanup_pending_closures(&self, seconds_old: i64) -> ServerResult<CleanupOutcome> {
        let cutoff = Utc::now() - chrono::Duration::seconds(seconds_old);

        self.transaction::<_, CleanupOutcome, ServerError>(|txn| {
            Box::pin(async move {
                let stale = PendingClosure::find()
                    .filter(pending_closure::Column::StartedAt.lt(cutoff))
                    .all(txn)
                    .await
                    .map_err(ServerError::database_error)?;

                let mut outcome = CleanupOutcome::default();

                for pending_closure in stale {
                    let pending_objects = PendingObject::find()
                        .filter(pending_object::Column::PendingClosureId.eq(pending_closure.id))
                        .all(txn)
                        .await
                        .map_err(ServerError::database_error)?;

                    for pending in pending_objects {
                        tombstone_orphan(txn, &pending.key, pending.refs.0, cutoff).await?;
                    }

                    let uploads = MultipartUpload::find()
                        .filter(multipart_upload::Column::PendingClosureId.eq(pending_closure.id))
                        .all(txn)
                        .await
                        .map_err(ServerError::database_error)?;
                    outcome
                        .multipart_upload_ids
                        .extend(uploads.into_iter().map(|u| u.upload_id));

                    PendingClosure::delete_by_id(pending_closure.id)
                        .exec(txn)
                        .await
                        .map_err(ServerError::database_error)?;

                    outcome.pending_closures_removed += 1;
                }

                Ok(outcome)
            })
        })
        .await
        .map_err(|e| match e {
            sea_orm::TransactionError::Connection(db_err) => ServerError::database_error(db_err),
            sea_orm::TransactionError::Transaction(server_err) => server_err,
        })
    }

    async fn get_old_multipart_uploads(&self, seconds_old: i64) -> ServerResult<Vec<(String, String)>> {
        let cutoff = Utc::now() - chrono::Duration::seconds(seconds_old);

        let rows: Vec<(String, String)> = MultipartUpload::find()
            .select_only()
            .column(multipart_upload::Column::ObjectKey)
            .column(multipart_upload::Column::UploadId)
            .join(
                sea_orm::JoinType::InnerJoin,
                multipart_upload::Relation::PendingClosure.def(),
            )
            .filter(pending_closure::Column::StartedAt.lt(cutoff))
            .into_tuple()
            .all(self)
            .await
            .map_err(ServerError::database_error)?;

        Ok(rows)
    }

    async fn vacuum(&self) -> ServerResult<()> {
        const TABLES: [&str; 5] = [
            "closure",
            "object",
            "pending_closure",
            "pending_object",
            "multipart_upload",
        ];

        match self.get_database_backend() {
            sea_orm::DatabaseBackend::Postgres => {
                for table in TABLES {
                    let stmt = sea_orm::Statement::from_string(
                        sea_orm::DatabaseBackend::Postgres,
                        format!("VACUUM (ANALYZE) \"{table}\""),
                    );
                    self.execute(stmt).await.map_err(ServerError::database_error)?;
                }
            }
            sea_orm::DatabaseBackend::MySql | sea_orm::DatabaseBackend::Sqlite => {
                // No online, non-blocking equivalent worth running from
                // application code on these engines.
            }
        }

        Ok(())
    }
}

/// Inserts or bumps a closure's `updated_at`.
async fn upsert_closure(
    txn: &sea_orm::DatabaseTransaction,
    key: &str,
    now: DateTime<Utc>,
) -> ServerResult<()> {
    let existing = Closure::find_by_id(key.to_owned())
        .one(txn)
        .await
        .map_err(ServerError::database_error)?;

    match existing {
        Some(model) => {
            let mut active: closure::ActiveModel = model.into();
            active.updated_at = Set(now);
            active
                .update(txn)
                .await
                .map_err(ServerError::database_error)?;
        }
        None => {
            let active = closure::ActiveModel {
                key: Set(key.to_owned()),
                updated_at: Set(now),
            };
            active
                .insert(txn)
                .await
                .map_err(ServerError::database_error)?;
        }
    }

    Ok(())
}

/// Inserts an object, or unions its refs into an existing row and clears
/// its tombstone (resurrection). `first_deleted_at` is never cleared here.
async fn upsert_object(
    txn: &sea_orm::DatabaseTransaction,
    key: &str,
    refs: Vec<String>,
) -> ServerResult<()> {
    let existing = Object::find_by_id(key.to_owned())
        .one(txn)
        .await
        .map_err(ServerError::database_error)?;

    match existing {
        Some(model) => {
            let mut union: HashSet<String> = model.refs.0.into_iter().collect();
            union.extend(refs);
            let mut merged: Vec<String> = union.into_iter().collect();
            merged.sort();

            let mut active: object::ActiveModel = model.into();
            active.refs = Set(Json(merged));
            active.deleted_at = Set(None);
            active
                .update(txn)
                .await
                .map_err(ServerError::database_error)?;
        }
        None => {
            let active = object::ActiveModel {
                key: Set(key.to_owned()),
                refs: Set(Json(refs)),
                deleted_at: Set(None),
                first_deleted_at: Set(None),
            };
            active
                .insert(txn)
                .await
                .map_err(ServerError::database_error)?;
        }
    }

    Ok(())
}

/// Inserts a tombstoned placeholder for an abandoned pending object. A
/// row that already exists (because the client's presigned PUT raced the
/// cleanup pass and the commit already ran) is left untouched — `ON
/// CONFLICT DO NOTHING` semantics.
async fn tombstone_orphan(
    txn: &sea_orm::DatabaseTransaction,
    key: &str,
    refs: Vec<String>,
    cutoff: DateTime<Utc>,
) -> ServerResult<()> {
    let existing = Object::find_by_id(key.to_owned())
        .one(txn)
        .await
        .map_err(ServerError::database_error)?;

    if existing.is_some() {
        return Ok(());
    }

    let active = object::ActiveModel {
        key: Set(key.to_owned()),
        refs: Set(Json(refs)),
        deleted_at: Set(Some(cutoff)),
        first_deleted_at: Set(Some(cutoff)),
    };

    active
        .insert(txn)
        .await
        .map_err(ServerError::database_error)?;

    Ok(())
}

/// BFS over `objects.refs` starting from `roots`, returning every
/// reachable object row.
async fn bfs_reachable<C: ConnectionTrait>(
    conn: &C,
    roots: &[String],
) -> ServerResult<Vec<ObjectModel>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut worklist: VecDeque<String> = roots.iter().cloned().collect();
    let mut result = Vec::new();

    while !worklist.is_empty() {
        let batch: Vec<String> = worklist
            .drain(..)
            .filter(|key| seen.insert(key.clone()))
            .collect();

        if batch.is_empty() {
            continue;
        }

        let rows = Object::find()
            .filter(object::Column::Key.is_in(batch))
            .all(conn)
            .await
            .map_err(ServerError::database_error)?;

        for row in rows {
            for r in &row.refs.0 {
                if !seen.contains(r) {
                    worklist.push_back(r.clone());
                }
            }
            result.push(row);
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_pending_object_carries_refs() {
        let row = NewPendingObject {
            key: "abc.narinfo".into(),
            refs: vec!["def".into()],
        };
        assert_eq!(row.refs.len(), 1);
    }
}
