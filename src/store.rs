//! The task queue core: a single SQLite connection behind a mutex, shared
//! by every caller through cheap `Arc` clones.
//!
//! Grounded on `adv_sqlite.rs`'s `TaskDb`/`SqliteTaskManager` split, but
//! collapsed to one backend: a path of `:memory:` opens an in-memory
//! database instead of selecting a whole separate implementation.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use rusqlite::{params, Connection, ToSql};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::record::{
    join_ancestry, task_ins_from_row, task_res_from_row, NewTask, NodeId, TaskId, TaskIns, TaskRes,
};
use crate::validator::{DefaultValidator, Validator};

/// Lifetime of a freshly stored record before it is eligible for reaping,
/// absent a caller-supplied override.
const DEFAULT_TTL: Duration = Duration::hours(24);

const TASK_INS_COLUMNS: &str = "task_id, group_id, workload_id, producer_anonymous, \
     producer_node_id, consumer_anonymous, consumer_node_id, created_at, delivered_at, ttl, \
     ancestry, payload_server, payload_client";

const TASK_RES_COLUMNS: &str = TASK_INS_COLUMNS;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS metadata(
  key TEXT UNIQUE NOT NULL PRIMARY KEY,
  value TEXT NOT NULL
);

INSERT OR IGNORE INTO metadata(key, value) VALUES ('task_db_version', '1');

CREATE TABLE IF NOT EXISTS node(
  id INTEGER UNIQUE NOT NULL PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS task_ins(
  task_id TEXT UNIQUE NOT NULL PRIMARY KEY,
  group_id TEXT NOT NULL,
  workload_id TEXT NOT NULL,
  producer_anonymous INTEGER NOT NULL,
  producer_node_id INTEGER NOT NULL,
  consumer_anonymous INTEGER NOT NULL,
  consumer_node_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  delivered_at TEXT NOT NULL,
  ttl TEXT NOT NULL,
  ancestry TEXT NOT NULL,
  payload_server BLOB,
  payload_client BLOB
);

CREATE INDEX IF NOT EXISTS idx_task_ins_consumer
  ON task_ins(consumer_anonymous, consumer_node_id, delivered_at);

CREATE TABLE IF NOT EXISTS task_res(
  task_id TEXT UNIQUE NOT NULL PRIMARY KEY,
  group_id TEXT NOT NULL,
  workload_id TEXT NOT NULL,
  producer_anonymous INTEGER NOT NULL,
  producer_node_id INTEGER NOT NULL,
  consumer_anonymous INTEGER NOT NULL,
  consumer_node_id INTEGER NOT NULL,
  created_at TEXT NOT NULL,
  delivered_at TEXT NOT NULL,
  ttl TEXT NOT NULL,
  ancestry TEXT NOT NULL,
  payload_server BLOB,
  payload_client BLOB
);

CREATE INDEX IF NOT EXISTS idx_task_res_ancestry
  ON task_res(ancestry, delivered_at);
"#;

/// Per-table byte sizes as reported by SQLite's `dbstat` virtual table.
pub type TableSizes = Vec<(String, u64)>;

/// Persistent state of the task exchange: the node registry plus the
/// `task_ins`/`task_res` queues, addressed through a single shared
/// connection.
#[derive(Clone)]
pub struct TaskStore {
    conn: Arc<Mutex<Connection>>,
    validator: Arc<dyn Validator>,
    clock: Arc<dyn Clock>,
}

fn open_connection(path: &str) -> StoreResult<Connection> {
    let conn = if path == ":memory:" {
        Connection::open_in_memory()?
    } else {
        Connection::open(path)?
    };
    conn.pragma_update(None, "foreign_keys", true)?;
    if path != ":memory:" {
        conn.pragma_update(None, "journal_mode", "WAL")?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    Ok(conn)
}

fn table_names(conn: &Connection) -> StoreResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(names)
}

/// Opens (creating on first use) the store at `path`, using the default
/// validator and system clock, and returns the tables now present
/// alongside it -- useful for a caller that wants to confirm the schema
/// it just created or inherited.
pub fn initialize(path: &str) -> StoreResult<(TaskStore, Vec<String>)> {
    initialize_with(path, Arc::new(DefaultValidator), Arc::new(SystemClock))
}

/// As [`initialize`], with an injected validator and clock -- the seam
/// tests use to exercise TTL and rejection behavior deterministically.
pub fn initialize_with(
    path: &str,
    validator: Arc<dyn Validator>,
    clock: Arc<dyn Clock>,
) -> StoreResult<(TaskStore, Vec<String>)> {
    let conn = open_connection(path)?;
    conn.execute_batch(SCHEMA_SQL)?;
    let tables = table_names(&conn)?;
    info!("opened task store at {path}, tables: {tables:?}");
    Ok((
        TaskStore {
            conn: Arc::new(Mutex::new(conn)),
            validator,
            clock,
        },
        tables,
    ))
}

impl TaskStore {
    /// Opens (creating on first use) the store at `path`.
    pub fn open(path: &str) -> StoreResult<Self> {
        Ok(initialize(path)?.0)
    }

    /// As [`open`](Self::open), with an injected validator and clock.
    pub fn open_with(
        path: &str,
        validator: Arc<dyn Validator>,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        Ok(initialize_with(path, validator, clock)?.0)
    }

    /// Releases the underlying connection. Best-effort: if other clones of
    /// this store are still alive, the connection is simply dropped once
    /// the last one goes out of scope.
    pub fn teardown(self) -> StoreResult<()> {
        match Arc::try_unwrap(self.conn) {
            Ok(mutex) => {
                let conn = mutex.into_inner().unwrap_or_else(|poison| poison.into_inner());
                conn.close().map_err(|(_, err)| StoreError::Storage(err))?;
            }
            Err(_still_shared) => {
                debug!("teardown called while other store handles are still alive");
            }
        }
        Ok(())
    }

    // ---- node registry -------------------------------------------------

    /// Registers a node, ignoring the call if it is already registered.
    /// The registry is a set of ids; registering one already present
    /// shouldn't fail any more than inserting an already-present element
    /// into a `HashSet` would.
    pub fn register_node(&self, node_id: NodeId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO node(id) VALUES (?1)",
            params![node_id as i64],
        )?;
        info!("registered node {node_id}");
        Ok(())
    }

    /// Removes a node from the registry. Does not touch any `task_ins`/
    /// `task_res` rows already addressed to it.
    pub fn unregister_node(&self, node_id: NodeId) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let removed = conn.execute("DELETE FROM node WHERE id = ?1", params![node_id as i64])?;
        if removed == 0 {
            warn!("unregister_node called for unknown node {node_id}");
        }
        Ok(())
    }

    /// Returns every currently registered node id.
    pub fn get_nodes(&self) -> StoreResult<Vec<NodeId>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT id FROM node ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .map(|row| row.map(|id| id as u64))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    // ---- task_ins --------------------------------------------------

    /// Validates and stores a new instruction, returning its minted id, or
    /// `Ok(None)` if the validator rejected it (a soft failure, not an
    /// error).
    pub fn store_task_ins(&self, task: NewTask) -> StoreResult<Option<TaskId>> {
        let errors = self.validator.validate_task_ins(&task);
        if !errors.is_empty() {
            warn!("rejected task_ins: {errors:?}");
            return Ok(None);
        }
        let task_id = Uuid::new_v4().to_string();
        let created_at = self.clock.now();
        let ttl = created_at + DEFAULT_TTL;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO task_ins ({TASK_INS_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '', ?9, ?10, ?11, NULL)"
            ),
            params![
                task_id,
                task.group_id,
                task.workload_id,
                task.producer_anonymous,
                task.producer_node_id as i64,
                task.consumer_anonymous,
                task.consumer_node_id as i64,
                created_at.to_rfc3339(),
                ttl.to_rfc3339(),
                join_ancestry(&task.ancestry),
                task.payload,
            ],
        )?;
        info!("stored task_ins {task_id}");
        Ok(Some(task_id))
    }

    /// Atomically claims up to `limit` pending instructions addressed to
    /// `node_id` (`None` for the anonymous queue), marking them delivered
    /// in the same statement so no two callers can claim the same row.
    pub fn get_task_ins(&self, node_id: Option<NodeId>, limit: Option<u32>) -> StoreResult<Vec<TaskIns>> {
        if let Some(limit) = limit {
            if limit < 1 {
                return Err(StoreError::InvalidArgument("limit must be >= 1".into()));
            }
        }
        if node_id == Some(0) {
            return Ok(Vec::new());
        }
        let (anonymous, target_node): (bool, i64) = match node_id {
            None => (true, 0),
            Some(id) => (false, id as i64),
        };
        let now = self.clock.now().to_rfc3339();
        let limit_value = limit.map(|l| l as i64).unwrap_or(-1);
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "UPDATE task_ins SET delivered_at = ?1 \
             WHERE task_id IN ( \
                 SELECT task_id FROM task_ins \
                 WHERE delivered_at = '' AND consumer_anonymous = ?2 AND consumer_node_id = ?3 \
                 LIMIT ?4 \
             ) \
             RETURNING {TASK_INS_COLUMNS}"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![now, anonymous, target_node, limit_value], task_ins_from_row)?;
        let tasks = rows.collect::<Result<Vec<_>, _>>()?;
        debug!("claimed {} task_ins for node={node_id:?}", tasks.len());
        Ok(tasks)
    }

    // ---- task_res --------------------------------------------------

    /// Validates and stores a new result, returning its minted id, or
    /// `Ok(None)` if rejected.
    pub fn store_task_res(&self, task: NewTask) -> StoreResult<Option<TaskId>> {
        let errors = self.validator.validate_task_res(&task);
        if !errors.is_empty() {
            warn!("rejected task_res: {errors:?}");
            return Ok(None);
        }
        let task_id = Uuid::new_v4().to_string();
        let created_at = self.clock.now();
        let ttl = created_at + DEFAULT_TTL;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!(
                "INSERT INTO task_res ({TASK_RES_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, '', ?9, ?10, NULL, ?11)"
            ),
            params![
                task_id,
                task.group_id,
                task.workload_id,
                task.producer_anonymous,
                task.producer_node_id as i64,
                task.consumer_anonymous,
                task.consumer_node_id as i64,
                created_at.to_rfc3339(),
                ttl.to_rfc3339(),
                join_ancestry(&task.ancestry),
                task.payload,
            ],
        )?;
        if let Some(parent_id) = task.ancestry.first() {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM task_ins WHERE task_id = ?1)",
                params![parent_id],
                |row| row.get(0),
            )?;
            if !exists {
                warn!("task_res {task_id} has orphaned ancestry {parent_id}: no such task_ins");
            }
        }
        info!("stored task_res {task_id}");
        Ok(Some(task_id))
    }

    /// Atomically claims every pending result whose ancestry names one of
    /// `task_ids`, up to `limit`. Returns immediately without touching
    /// storage if `task_ids` is empty.
    pub fn get_task_res(&self, task_ids: &HashSet<TaskId>, limit: Option<u32>) -> StoreResult<Vec<TaskRes>> {
        if let Some(limit) = limit {
            if limit < 1 {
                return Err(StoreError::InvalidArgument("limit must be >= 1".into()));
            }
        }
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let now = self.clock.now().to_rfc3339();
        let limit_value = limit.map(|l| l as i64).unwrap_or(-1);
        let placeholders = vec!["?"; task_ids.len()].join(",");
        let sql = format!(
            "UPDATE task_res SET delivered_at = ? \
             WHERE task_id IN ( \
                 SELECT task_id FROM task_res \
                 WHERE delivered_at = '' AND ancestry IN ({placeholders}) \
                 LIMIT ? \
             ) \
             RETURNING {TASK_RES_COLUMNS}"
        );
        let mut bound: Vec<Box<dyn ToSql>> = Vec::with_capacity(task_ids.len() + 2);
        bound.push(Box::new(now));
        for id in task_ids {
            bound.push(Box::new(id.clone()));
        }
        bound.push(Box::new(limit_value));
        let refs: Vec<&dyn ToSql> = bound.iter().map(|b| b.as_ref()).collect();

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(refs.as_slice(), task_res_from_row)?;
        let tasks = rows.collect::<Result<Vec<_>, _>>()?;
        debug!("claimed {} task_res for {} ancestors", tasks.len(), task_ids.len());
        Ok(tasks)
    }

    // ---- cleanup --------------------------------------------------

    /// Deletes every listed `task_res` row that has been delivered, plus
    /// the `task_ins` row each one answers, provided that instruction has
    /// itself already been delivered. A `task_ins` still awaiting pickup
    /// is left alone even if its result is being deleted -- deleting a
    /// still-pending instruction out from under a consumer that hasn't
    /// fetched it yet would silently lose work.
    pub fn delete_tasks(&self, task_ids: &HashSet<TaskId>) -> StoreResult<()> {
        if task_ids.is_empty() {
            return Ok(());
        }
        let placeholders = vec!["?"; task_ids.len()].join(",");
        let ids: Vec<&TaskId> = task_ids.iter().collect();

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let sql = format!(
                "DELETE FROM task_ins WHERE delivered_at != '' AND task_id IN ( \
                     SELECT ancestry FROM task_res \
                     WHERE delivered_at != '' AND task_id IN ({placeholders}) \
                 )"
            );
            let params: Vec<&dyn ToSql> = ids.iter().map(|id| *id as &dyn ToSql).collect();
            tx.execute(&sql, params.as_slice())?;
        }
        {
            let sql = format!(
                "DELETE FROM task_res WHERE delivered_at != '' AND task_id IN ({placeholders})"
            );
            let params: Vec<&dyn ToSql> = ids.iter().map(|id| *id as &dyn ToSql).collect();
            let removed = tx.execute(&sql, params.as_slice())?;
            debug!("deleted {removed} task_res rows");
        }
        tx.commit()?;
        Ok(())
    }

    /// Deletes every `task_ins`/`task_res` row that is either already
    /// delivered or past its `ttl`, returning the total number of rows
    /// removed. Lets a caller run periodic housekeeping without
    /// hand-rolling the two DELETE statements itself.
    pub fn reap_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now().to_rfc3339();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let ins_removed = tx.execute(
            "DELETE FROM task_ins WHERE delivered_at != '' OR ttl < ?1",
            params![now],
        )?;
        let res_removed = tx.execute(
            "DELETE FROM task_res WHERE delivered_at != '' OR ttl < ?1",
            params![now],
        )?;
        tx.commit()?;
        let total = ins_removed + res_removed;
        if total > 0 {
            info!("reaped {total} expired/delivered rows");
        }
        Ok(total)
    }

    // ---- counters --------------------------------------------------

    /// Total number of `task_ins` rows currently stored, delivered or not.
    pub fn num_task_ins(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM task_ins", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Total number of `task_res` rows currently stored, delivered or not.
    pub fn num_task_res(&self) -> StoreResult<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM task_res", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Total and per-table on-disk size, as reported by SQLite's `dbstat`
    /// virtual table (requires the `bundled` feature, which compiles it
    /// in -- see `adv_sqlite.rs`'s `get_db_size` query, which this
    /// mirrors).
    pub fn size(&self) -> StoreResult<(u64, TableSizes)> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT name, SUM(pgsize) FROM dbstat GROUP BY name ORDER BY SUM(pgsize) DESC",
        )?;
        let sizes = stmt
            .query_map([], |row| {
                let name: String = row.get(0)?;
                let bytes: i64 = row.get(1)?;
                Ok((name, bytes as u64))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        let total = sizes.iter().map(|(_, bytes)| bytes).sum();
        Ok((total, sizes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::testing::FixedClock;
    use chrono::{TimeZone, Utc};

    fn epoch() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    fn store() -> TaskStore {
        TaskStore::open_with(":memory:", Arc::new(DefaultValidator), Arc::new(FixedClock::new(epoch())))
            .expect("in-memory store opens")
    }

    fn new_task(consumer_anonymous: bool, consumer_node_id: NodeId) -> NewTask {
        NewTask {
            group_id: "group".into(),
            workload_id: "workload".into(),
            producer_anonymous: true,
            producer_node_id: 0,
            consumer_anonymous,
            consumer_node_id,
            ancestry: Vec::new(),
            payload: b"payload".to_vec(),
        }
    }

    #[test]
    fn initialize_reports_expected_tables() {
        let (_store, tables) = initialize(":memory:").unwrap();
        for expected in ["metadata", "node", "task_ins", "task_res"] {
            assert!(tables.contains(&expected.to_owned()), "missing table {expected}");
        }
    }

    #[test]
    fn register_node_is_idempotent_and_listed() {
        let store = store();
        store.register_node(7).unwrap();
        store.register_node(7).unwrap();
        assert_eq!(store.get_nodes().unwrap(), vec![7]);
        store.unregister_node(7).unwrap();
        assert!(store.get_nodes().unwrap().is_empty());
    }

    #[test]
    fn anonymous_task_ins_is_claimed_exactly_once() {
        let store = store();
        let id = store.store_task_ins(new_task(true, 0)).unwrap().unwrap();

        let first = store.get_task_ins(None, None).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].task_id, id);

        let second = store.get_task_ins(None, None).unwrap();
        assert!(second.is_empty());
    }

    #[test]
    fn directed_task_ins_is_isolated_to_its_node() {
        let store = store();
        store.store_task_ins(new_task(false, 1)).unwrap().unwrap();
        store.store_task_ins(new_task(false, 2)).unwrap().unwrap();

        let for_node_one = store.get_task_ins(Some(1), None).unwrap();
        assert_eq!(for_node_one.len(), 1);
        assert_eq!(for_node_one[0].consumer_node_id, 1);

        let for_node_zero = store.get_task_ins(Some(0), None).unwrap();
        assert!(for_node_zero.is_empty());
    }

    #[test]
    fn rejects_task_ins_with_bad_addressing_without_erroring() {
        let store = store();
        let result = store.store_task_ins(new_task(true, 9)).unwrap();
        assert!(result.is_none());
        assert_eq!(store.num_task_ins().unwrap(), 0);
    }

    #[test]
    fn get_task_ins_rejects_zero_limit() {
        let store = store();
        let err = store.get_task_ins(None, Some(0)).unwrap_err();
        assert!(matches!(err, StoreError::InvalidArgument(_)));
    }

    #[test]
    fn get_task_ins_honors_limit() {
        let store = store();
        for _ in 0..3 {
            store.store_task_ins(new_task(true, 0)).unwrap().unwrap();
        }
        let claimed = store.get_task_ins(None, Some(2)).unwrap();
        assert_eq!(claimed.len(), 2);
        let remaining = store.get_task_ins(None, None).unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[test]
    fn task_res_is_paired_by_ancestry_and_then_deletable() {
        let store = store();
        let ins_id = store.store_task_ins(new_task(true, 0)).unwrap().unwrap();
        store.get_task_ins(None, None).unwrap();

        let mut reply = new_task(true, 0);
        reply.ancestry = vec![ins_id.clone()];
        let res_id = store.store_task_res(reply).unwrap().unwrap();

        let mut wanted = HashSet::new();
        wanted.insert(ins_id.clone());
        let claimed = store.get_task_res(&wanted, None).unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].task_id, res_id);

        let mut to_delete = HashSet::new();
        to_delete.insert(res_id);
        store.delete_tasks(&to_delete).unwrap();
        assert_eq!(store.num_task_ins().unwrap(), 0);
        assert_eq!(store.num_task_res().unwrap(), 0);
    }

    #[test]
    fn task_res_with_orphaned_ancestry_is_still_stored() {
        let store = store();
        let mut reply = new_task(true, 0);
        reply.ancestry = vec!["no-such-task-ins".into()];
        let res_id = store.store_task_res(reply).unwrap();
        assert!(res_id.is_some());
        assert_eq!(store.num_task_res().unwrap(), 1);
    }

    #[test]
    fn get_task_res_returns_empty_for_empty_ancestor_set() {
        let store = store();
        let claimed = store.get_task_res(&HashSet::new(), None).unwrap();
        assert!(claimed.is_empty());
    }

    #[test]
    fn reap_expired_removes_rows_past_their_ttl() {
        let clock = Arc::new(FixedClock::new(epoch()));
        let store = TaskStore::open_with(":memory:", Arc::new(DefaultValidator), clock.clone()).unwrap();
        store.store_task_ins(new_task(true, 0)).unwrap().unwrap();

        clock.advance(Duration::hours(25));
        let removed = store.reap_expired().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.num_task_ins().unwrap(), 0);
    }
}
