//! The trails manager: every read and write of the `trails` table.
//!
//! The manager holds a shared handle to a connection pool and nothing else.
//! Each public operation checks out one pooled connection on a blocking
//! worker thread, optionally wraps its statements in a transaction, and
//! hands the connection back before returning, on success and on failure
//! alike.

use std::sync::{Arc, PoisonError, RwLock};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde_json::Value;
use trail_db::{create_pool, DbPool, DbRuntimeSettings};

use crate::error::ManagerError;
use crate::query::{storage_timestamp, EnumerateCriteria, SearchCriteria, SqlQuery, TRAIL_COLUMNS};
use crate::trail::{convert_to_trail, Attributes, IdKeys, Trail, DEFAULT_ID_KEY};

/// Data-access facade over the `trails` table.
///
/// Cloning is cheap and clones share the same pool; closing one clone
/// closes them all.
#[derive(Clone)]
pub struct TrailsManager {
    pool: Arc<RwLock<Option<DbPool>>>,
}

impl std::fmt::Debug for TrailsManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrailsManager")
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TrailsManager {
    /// Wraps an externally supplied pool.
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool: Arc::new(RwLock::new(Some(pool))),
        }
    }

    /// Opens a pool on `db_path` with the given settings.
    ///
    /// The schema is expected to be migrated already (see
    /// [`trail_db::run_migrations`]).
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::PoolInit` if the pool cannot be built.
    pub fn connect(db_path: &str, settings: DbRuntimeSettings) -> Result<Self, ManagerError> {
        Ok(Self::new(create_pool(db_path, settings)?))
    }

    /// Releases the pool. Every later operation fails with
    /// `ManagerError::PoolClosed`.
    ///
    /// Connections currently checked out are closed once their operations
    /// finish.
    pub fn close(&self) {
        let released = self
            .pool
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if released.is_some() {
            tracing::info!("trails manager closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn pool(&self) -> Result<DbPool, ManagerError> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(ManagerError::PoolClosed)
    }

    /// Runs `operation` against one pooled connection.
    ///
    /// With `use_transaction`, the operation runs inside `BEGIN`/`COMMIT`
    /// and any error rolls the transaction back. Without it, every
    /// statement the operation issued stays committed even if it then
    /// fails. Either way the connection goes back to the pool exactly once
    /// and the operation's own error is returned unchanged.
    ///
    /// Calls are independent: two concurrent calls never share a
    /// connection or a transaction.
    ///
    /// # Errors
    ///
    /// The operation's error, or a [`ManagerError`] (converted into `E`)
    /// if the pool is closed, no connection can be acquired, or the
    /// transaction cannot be started or committed.
    pub async fn perform_database_operations<T, E, F>(
        &self,
        operation: F,
        use_transaction: bool,
    ) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<ManagerError> + Send + 'static,
    {
        let pool = self.pool().map_err(E::from)?;

        tokio::task::spawn_blocking(move || run_operation(&pool, operation, use_transaction))
            .await
            .map_err(|e| E::from(ManagerError::Task(e.to_string())))?
    }

    /// Executes a single raw statement and returns the number of rows it
    /// changed.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Database` if the statement fails.
    pub async fn execute_statement(
        &self,
        query: SqlQuery,
        use_transaction: bool,
    ) -> Result<usize, ManagerError> {
        self.perform_database_operations(
            move |conn| {
                Ok::<_, ManagerError>(conn.execute(&query.sql, params_from_iter(query.params.iter()))?)
            },
            use_transaction,
        )
        .await
    }

    /// Finds trails in a time range, optionally filtered by component ids.
    ///
    /// # Errors
    ///
    /// Validation errors (raised before touching the database) or storage
    /// errors.
    pub async fn search(&self, criteria: &SearchCriteria) -> Result<Vec<Trail>, ManagerError> {
        let plan = criteria.validate()?;
        let query = plan.to_sql();

        tracing::debug!(
            filters = plan.filters.len(),
            page = plan.pagination.page,
            page_size = plan.pagination.page_size,
            "searching trails"
        );

        self.perform_database_operations(
            move |conn| {
                let mut stmt = conn.prepare(&query.sql)?;
                let rows = stmt.query_map(params_from_iter(query.params.iter()), TrailRow::from_row)?;

                let mut trails = Vec::new();
                for row in rows {
                    trails.push(row?.into_trail()?);
                }
                Ok::<_, ManagerError>(trails)
            },
            true,
        )
        .await
    }

    /// Lists the distinct ids of one component within a time range.
    ///
    /// # Errors
    ///
    /// Validation errors (raised before touching the database) or storage
    /// errors.
    pub async fn enumerate(&self, criteria: &EnumerateCriteria) -> Result<Vec<String>, ManagerError> {
        let plan = criteria.validate()?;
        let query = plan.to_sql();

        tracing::debug!(
            kind = %plan.kind,
            page = plan.pagination.page,
            page_size = plan.pagination.page_size,
            "enumerating trail components"
        );

        self.perform_database_operations(
            move |conn| {
                let mut stmt = conn.prepare(&query.sql)?;
                let rows = stmt.query_map(params_from_iter(query.params.iter()), |row| row.get(0))?;
                Ok::<_, ManagerError>(rows.collect::<Result<Vec<String>, _>>()?)
            },
            true,
        )
        .await
    }

    /// Validates and stores a new trail, returning its generated id.
    ///
    /// Any `id` in the input is ignored. Component ids are read from the
    /// `id` property; use [`insert_with_id_keys`](Self::insert_with_id_keys)
    /// for records that name them differently.
    ///
    /// # Errors
    ///
    /// `ManagerError::Trail` for invalid input, or storage errors.
    pub async fn insert(&self, trail: &Value) -> Result<i64, ManagerError> {
        self.insert_with_id_keys(trail, &IdKeys::default()).await
    }

    /// Like [`insert`](Self::insert), reading each component id from the
    /// property named in `id_keys`.
    ///
    /// # Errors
    ///
    /// `ManagerError::Trail` for invalid input, or storage errors.
    pub async fn insert_with_id_keys(
        &self,
        trail: &Value,
        id_keys: &IdKeys,
    ) -> Result<i64, ManagerError> {
        let trail = convert_to_trail(trail, id_keys)?;
        let columns = TrailColumns::from_trail(&trail)?;

        let id = self
            .perform_database_operations(
                move |conn| {
                    let id: i64 = conn.query_row(
                        r#"INSERT INTO trails ("when", who_id, what_id, subject_id, who_data, what_data, subject_data, "where", why, meta)
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                           RETURNING id"#,
                        params![
                            columns.when,
                            columns.who_id,
                            columns.what_id,
                            columns.subject_id,
                            columns.who_data,
                            columns.what_data,
                            columns.subject_data,
                            columns.where_data,
                            columns.why,
                            columns.meta,
                        ],
                        |row| row.get(0),
                    )?;
                    Ok::<_, ManagerError>(id)
                },
                true,
            )
            .await?;

        tracing::debug!(trail_id = id, "inserted trail");
        Ok(id)
    }

    /// Fetches a trail by id; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Storage errors, or `ManagerError::Serialization` if a stored JSON
    /// column is corrupt.
    pub async fn get(&self, id: i64) -> Result<Option<Trail>, ManagerError> {
        self.perform_database_operations(
            move |conn| {
                let row = conn
                    .query_row(
                        &format!("SELECT {TRAIL_COLUMNS} FROM trails WHERE id = ?1"),
                        [id],
                        TrailRow::from_row,
                    )
                    .optional()?;
                row.map(TrailRow::into_trail).transpose()
            },
            true,
        )
        .await
    }

    /// Overwrites every mutable field of the trail with id `id`.
    ///
    /// Returns `false` when no such trail exists. Component ids are read
    /// from the `id` property.
    ///
    /// # Errors
    ///
    /// `ManagerError::Trail` for invalid input, or storage errors.
    pub async fn update(&self, id: i64, trail: &Value) -> Result<bool, ManagerError> {
        self.update_with_id_keys(id, trail, &IdKeys::default()).await
    }

    /// Like [`update`](Self::update), reading each component id from the
    /// property named in `id_keys`.
    ///
    /// # Errors
    ///
    /// `ManagerError::Trail` for invalid input, or storage errors.
    pub async fn update_with_id_keys(
        &self,
        id: i64,
        trail: &Value,
        id_keys: &IdKeys,
    ) -> Result<bool, ManagerError> {
        let trail = convert_to_trail(trail, id_keys)?;
        let columns = TrailColumns::from_trail(&trail)?;

        let rows = self
            .perform_database_operations(
                move |conn| {
                    let rows = conn.execute(
                        r#"UPDATE trails
                           SET "when" = ?1,
                               who_id = ?2,
                               what_id = ?3,
                               subject_id = ?4,
                               who_data = ?5,
                               what_data = ?6,
                               subject_data = ?7,
                               "where" = ?8,
                               why = ?9,
                               meta = ?10
                           WHERE id = ?11"#,
                        params![
                            columns.when,
                            columns.who_id,
                            columns.what_id,
                            columns.subject_id,
                            columns.who_data,
                            columns.what_data,
                            columns.subject_data,
                            columns.where_data,
                            columns.why,
                            columns.meta,
                            id,
                        ],
                    )?;
                    Ok::<_, ManagerError>(rows)
                },
                true,
            )
            .await?;

        tracing::debug!(trail_id = id, rows, "updated trail");
        Ok(rows > 0)
    }

    /// Removes the trail with id `id`.
    ///
    /// Returns `false` when no such trail exists.
    ///
    /// # Errors
    ///
    /// Storage errors.
    pub async fn delete(&self, id: i64) -> Result<bool, ManagerError> {
        let rows = self
            .execute_statement(SqlQuery::new("DELETE FROM trails WHERE id = ?1").bind(id), true)
            .await?;

        tracing::debug!(trail_id = id, rows, "deleted trail");
        Ok(rows > 0)
    }
}

fn run_operation<T, E, F>(pool: &DbPool, operation: F, use_transaction: bool) -> Result<T, E>
where
    F: FnOnce(&Connection) -> Result<T, E>,
    E: From<ManagerError>,
{
    // If acquisition fails there is nothing to release.
    let conn = pool.get().map_err(|e| E::from(ManagerError::Pool(e)))?;

    if !use_transaction {
        return operation(&conn);
    }

    let tx = conn
        .unchecked_transaction()
        .map_err(|e| E::from(ManagerError::Database(e)))?;

    match operation(&tx) {
        Ok(value) => {
            tx.commit().map_err(|e| E::from(ManagerError::Database(e)))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback() {
                tracing::warn!(error = %rollback_err, "failed to roll back trail transaction");
            }
            Err(err)
        }
    }
}

/// A trail flattened into column values.
struct TrailColumns {
    when: String,
    who_id: String,
    what_id: String,
    subject_id: String,
    who_data: String,
    what_data: String,
    subject_data: String,
    where_data: String,
    why: String,
    meta: String,
}

impl TrailColumns {
    fn from_trail(trail: &Trail) -> Result<Self, ManagerError> {
        Ok(Self {
            when: storage_timestamp(&trail.when()),
            who_id: trail.who().id().to_string(),
            what_id: trail.what().id().to_string(),
            subject_id: trail.subject().id().to_string(),
            who_data: serde_json::to_string(trail.who().attributes())?,
            what_data: serde_json::to_string(trail.what().attributes())?,
            subject_data: serde_json::to_string(trail.subject().attributes())?,
            where_data: serde_json::to_string(trail.r#where())?,
            why: serde_json::to_string(trail.why())?,
            meta: serde_json::to_string(trail.meta())?,
        })
    }
}

/// A raw `trails` row, in [`TRAIL_COLUMNS`] order.
struct TrailRow {
    id: i64,
    when: String,
    who_id: String,
    what_id: String,
    subject_id: String,
    who_data: String,
    what_data: String,
    subject_data: String,
    where_data: String,
    why: String,
    meta: String,
}

impl TrailRow {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            when: row.get(1)?,
            who_id: row.get(2)?,
            what_id: row.get(3)?,
            subject_id: row.get(4)?,
            who_data: row.get(5)?,
            what_data: row.get(6)?,
            subject_data: row.get(7)?,
            where_data: row.get(8)?,
            why: row.get(9)?,
            meta: row.get(10)?,
        })
    }

    /// Merges each component id back into its attributes and runs the
    /// result through [`convert_to_trail`].
    ///
    /// Components stored under a custom id key may carry an `id`
    /// attribute of their own, so the id goes under the first of `id`,
    /// `_id`, `__id`, ... the attributes do not already use.
    fn into_trail(self) -> Result<Trail, ManagerError> {
        let component = |id: String, data: &str| -> Result<(Value, String), ManagerError> {
            let mut attributes: Attributes = serde_json::from_str(data)?;
            let mut key = DEFAULT_ID_KEY.to_string();
            while attributes.contains_key(&key) {
                key.insert(0, '_');
            }
            attributes.insert(key.clone(), Value::String(id));
            Ok((Value::Object(attributes), key))
        };

        let (who, who_key) = component(self.who_id, &self.who_data)?;
        let (what, what_key) = component(self.what_id, &self.what_data)?;
        let (subject, subject_key) = component(self.subject_id, &self.subject_data)?;
        let id_keys = IdKeys {
            who: who_key,
            what: what_key,
            subject: subject_key,
        };

        let mut record = Attributes::new();
        record.insert("id".to_string(), Value::from(self.id));
        record.insert("when".to_string(), Value::String(self.when));
        record.insert("who".to_string(), who);
        record.insert("what".to_string(), what);
        record.insert("subject".to_string(), subject);
        record.insert("where".to_string(), serde_json::from_str(&self.where_data)?);
        record.insert("why".to_string(), serde_json::from_str(&self.why)?);
        record.insert("meta".to_string(), serde_json::from_str(&self.meta)?);

        Ok(convert_to_trail(&Value::Object(record), &id_keys)?)
    }
}
