//! In-memory record types and the codec that flattens them to/from SQL rows.

use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

pub type NodeId = u64;
pub type TaskId = String;

/// A work order from a driver to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIns {
    pub task_id: TaskId,
    pub group_id: String,
    pub workload_id: String,
    pub producer_anonymous: bool,
    pub producer_node_id: NodeId,
    pub consumer_anonymous: bool,
    pub consumer_node_id: NodeId,
    pub created_at: String,
    pub delivered_at: String,
    pub ttl: String,
    pub ancestry: Vec<TaskId>,
    pub payload: Vec<u8>,
}

/// A reply from a worker to a driver. Same shape as `TaskIns`, except
/// `ancestry` carries exactly one entry: the id of the instruction it
/// answers. The store does not check this; a result whose ancestry is
/// empty or names more than one id is still accepted and stored as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRes {
    pub task_id: TaskId,
    pub group_id: String,
    pub workload_id: String,
    pub producer_anonymous: bool,
    pub producer_node_id: NodeId,
    pub consumer_anonymous: bool,
    pub consumer_node_id: NodeId,
    pub created_at: String,
    pub delivered_at: String,
    pub ttl: String,
    pub ancestry: Vec<TaskId>,
    pub payload: Vec<u8>,
}

/// Fields a driver/worker supplies when submitting a new instruction or
/// result; the store mints `task_id`, `created_at`, `delivered_at` and
/// `ttl` itself.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub group_id: String,
    pub workload_id: String,
    pub producer_anonymous: bool,
    pub producer_node_id: NodeId,
    pub consumer_anonymous: bool,
    pub consumer_node_id: NodeId,
    pub ancestry: Vec<TaskId>,
    pub payload: Vec<u8>,
}

/// Joins an ancestry list the way `adv_sqlite`-style codecs flatten nested
/// fields into a single column: comma-separated, relying on task ids (UUIDs)
/// never containing a comma.
pub(crate) fn join_ancestry(ancestry: &[TaskId]) -> String {
    ancestry.join(",")
}

/// Splits a stored ancestry column back into a list. Splitting an empty
/// string yields `[""]`; that is folded back to `[]` here.
pub(crate) fn split_ancestry(raw: &str) -> Vec<TaskId> {
    if raw.is_empty() {
        Vec::new()
    } else {
        raw.split(',').map(str::to_owned).collect()
    }
}

/// Reads a `TaskIns` out of a `task_ins` row. Column order must match the
/// `SELECT` list used by every query in `store.rs` that returns `task_ins`
/// rows.
pub(crate) fn task_ins_from_row(row: &Row<'_>) -> SqlResult<TaskIns> {
    let ancestry_raw: String = row.get("ancestry")?;
    Ok(TaskIns {
        task_id: row.get("task_id")?,
        group_id: row.get("group_id")?,
        workload_id: row.get("workload_id")?,
        producer_anonymous: row.get("producer_anonymous")?,
        producer_node_id: row.get::<_, i64>("producer_node_id")? as u64,
        consumer_anonymous: row.get("consumer_anonymous")?,
        consumer_node_id: row.get::<_, i64>("consumer_node_id")? as u64,
        created_at: row.get("created_at")?,
        delivered_at: row.get("delivered_at")?,
        ttl: row.get("ttl")?,
        ancestry: split_ancestry(&ancestry_raw),
        payload: row.get("payload_server")?,
    })
}

/// Reads a `TaskRes` out of a `task_res` row.
pub(crate) fn task_res_from_row(row: &Row<'_>) -> SqlResult<TaskRes> {
    let ancestry_raw: String = row.get("ancestry")?;
    Ok(TaskRes {
        task_id: row.get("task_id")?,
        group_id: row.get("group_id")?,
        workload_id: row.get("workload_id")?,
        producer_anonymous: row.get("producer_anonymous")?,
        producer_node_id: row.get::<_, i64>("producer_node_id")? as u64,
        consumer_anonymous: row.get("consumer_anonymous")?,
        consumer_node_id: row.get::<_, i64>("consumer_node_id")? as u64,
        created_at: row.get("created_at")?,
        delivered_at: row.get("delivered_at")?,
        ttl: row.get("ttl")?,
        ancestry: split_ancestry(&ancestry_raw),
        payload: row.get("payload_client")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestry_round_trips_without_commas() {
        let ancestry = vec!["a-1".to_owned(), "b-2".to_owned(), "c-3".to_owned()];
        let joined = join_ancestry(&ancestry);
        assert_eq!(split_ancestry(&joined), ancestry);
    }

    #[test]
    fn empty_ancestry_round_trips_to_empty_list() {
        let joined = join_ancestry(&[]);
        assert_eq!(joined, "");
        assert_eq!(split_ancestry(&joined), Vec::<TaskId>::new());
    }

    #[test]
    fn single_entry_ancestry_round_trips() {
        let ancestry = vec!["only-parent".to_owned()];
        let joined = join_ancestry(&ancestry);
        assert_eq!(split_ancestry(&joined), ancestry);
    }
}
