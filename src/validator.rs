//! Consumer-addressing validation.
//!
//! The real message-shape validator (which also inspects producer fields
//! and payload contents) lives outside the store; the store only depends
//! on its *contract*: a pure function from a record to a list of errors,
//! empty meaning accept.

use crate::record::NewTask;

pub trait Validator: Send + Sync {
    /// Validates a new instruction before it is stored. Returns an empty
    /// list to accept.
    fn validate_task_ins(&self, task: &NewTask) -> Vec<String>;

    /// Validates a new result before it is stored. Returns an empty list
    /// to accept.
    fn validate_task_res(&self, task: &NewTask) -> Vec<String>;
}

/// Enforces the consumer-addressing rule on both record kinds: a consumer
/// is either anonymous with node id zero, or directed with a nonzero node
/// id. Producer fields are intentionally not checked, matching the
/// original.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValidator;

fn validate_consumer_addressing(anonymous: bool, node_id: u64) -> Vec<String> {
    let valid = (anonymous && node_id == 0) || (!anonymous && node_id != 0);
    if valid {
        Vec::new()
    } else {
        vec![format!(
            "invalid consumer addressing: anonymous={anonymous}, node_id={node_id}"
        )]
    }
}

impl Validator for DefaultValidator {
    fn validate_task_ins(&self, task: &NewTask) -> Vec<String> {
        validate_consumer_addressing(task.consumer_anonymous, task.consumer_node_id)
    }

    fn validate_task_res(&self, task: &NewTask) -> Vec<String> {
        validate_consumer_addressing(task.consumer_anonymous, task.consumer_node_id)
    }
}
