//! Durable backing for the service registry.
//!
//! Only the registry touches the store. On hub startup the rows with
//! `status = 'online'` are loaded back into memory; on register a worker row
//! is upserted and its capability rows replaced in a single transaction; on
//! disconnect the row is marked offline and kept for inspection. Store
//! failures are logged by the caller and never block in-memory registration.

use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel_migrations::{
    EmbeddedMigrations, MigrationHarness, embed_migrations,
};

use crate::error::{HubError, HubResult};
use crate::wire::{WorkerDescriptor, WorkerStatus};

pub mod models;
pub mod schema;

use models::{CapabilityRow, NewCapabilityRow, WorkerRow};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[derive(Clone)]
pub struct Store {
    pool: Pool<ConnectionManager<SqliteConnection>>,
}

impl Store {
    /// Open (creating if needed) the SQLite database at `path` and run any
    /// pending migrations.
    pub fn open(path: &str) -> HubResult<Self> {
        let manager = ConnectionManager::<SqliteConnection>::new(path);
        let pool = Pool::builder()
            .max_size(4)
            .build(manager)
            .map_err(r2d2_error)?;

        let conn = &mut pool.get().map_err(r2d2_error)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|e| HubError::Persistence(e.to_string()))?;
        diesel::sql_query("PRAGMA foreign_keys = ON").execute(conn)?;

        Ok(Self { pool })
    }

    fn conn(
        &self,
    ) -> HubResult<PooledConnection<ConnectionManager<SqliteConnection>>>
    {
        self.pool.get().map_err(r2d2_error)
    }

    /// All workers whose durable status is still `online`, with their
    /// capabilities in insertion order.
    pub fn load_online(&self) -> HubResult<Vec<WorkerDescriptor>> {
        use schema::{capabilities, workers};

        let conn = &mut self.conn()?;
        let rows: Vec<WorkerRow> = workers::table
            .filter(workers::status.eq(WorkerStatus::Online.to_string()))
            .order(workers::registered_at.asc())
            .load(conn)?;

        rows.into_iter()
            .map(|row| {
                let caps: Vec<CapabilityRow> = capabilities::table
                    .filter(capabilities::worker_id.eq(&row.id))
                    .order(capabilities::id.asc())
                    .load(conn)?;
                Ok(row.into_descriptor(caps))
            })
            .collect()
    }

    /// Upsert the worker row and replace its capability rows, atomically.
    pub fn save_worker(&self, desc: &WorkerDescriptor) -> HubResult<()> {
        use schema::{capabilities, workers};

        let conn = &mut self.conn()?;
        let row = WorkerRow::from_descriptor(desc);
        let caps: Vec<NewCapabilityRow> = desc
            .capabilities
            .iter()
            .map(|cap| NewCapabilityRow::from_capability(&desc.id, cap))
            .collect();

        conn.transaction::<_, diesel::result::Error, _>(|conn| {
            diesel::insert_into(workers::table)
                .values(&row)
                .on_conflict(workers::id)
                .do_update()
                .set(&row)
                .execute(conn)?;
            diesel::delete(
                capabilities::table
                    .filter(capabilities::worker_id.eq(&desc.id)),
            )
            .execute(conn)?;
            diesel::insert_into(capabilities::table)
                .values(&caps)
                .execute(conn)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Flip the worker's durable status on disconnect; the row is retained.
    pub fn mark_offline(&self, worker_id: &str) -> HubResult<()> {
        use schema::workers;

        let conn = &mut self.conn()?;
        diesel::update(workers::table.find(worker_id))
            .set((
                workers::status.eq(WorkerStatus::Offline.to_string()),
                workers::last_seen.eq(chrono::Utc::now().naive_utc()),
            ))
            .execute(conn)?;
        Ok(())
    }
}

fn r2d2_error(e: diesel::r2d2::PoolError) -> HubError {
    HubError::DatabasePool(e)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Capability, RegistrationPayload};

    fn temp_store() -> Store {
        let path = std::env::temp_dir()
            .join(format!("caphub-test-{}.db", ulid::Ulid::new()));
        Store::open(path.to_str().unwrap()).unwrap()
    }

    fn descriptor(id: &str, caps: &[&str]) -> WorkerDescriptor {
        RegistrationPayload {
            worker_id: id.into(),
            worker_type: "rust".into(),
            capabilities: caps
                .iter()
                .map(|name| Capability::new(*name, "test"))
                .collect(),
            metadata: Default::default(),
        }
        .into_descriptor()
    }

    #[test]
    fn save_and_load_round_trips() {
        let store = temp_store();
        store
            .save_worker(&descriptor("w1", &["echo", "reverse"]))
            .unwrap();

        let loaded = store.load_online().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "w1");
        assert_eq!(
            loaded[0]
                .capabilities
                .iter()
                .map(|c| c.name.as_str())
                .collect::<Vec<_>>(),
            ["echo", "reverse"]
        );
    }

    #[test]
    fn re_register_replaces_capabilities() {
        let store = temp_store();
        store.save_worker(&descriptor("w1", &["ping"])).unwrap();
        store
            .save_worker(&descriptor("w1", &["ping", "pong"]))
            .unwrap();

        let loaded = store.load_online().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].capabilities.len(), 2);
    }

    #[test]
    fn offline_workers_are_not_loaded() {
        let store = temp_store();
        store.save_worker(&descriptor("w1", &["echo"])).unwrap();
        store.save_worker(&descriptor("w2", &["echo"])).unwrap();
        store.mark_offline("w1").unwrap();

        let loaded = store.load_online().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "w2");
    }
}
