//! Task lineage
//!
//! Tasks form a parent/child tree mirrored by the tokens working on them.
//! The verifier checks that a caller's claimed lineage matches what
//! issuance actually recorded, and reconstructs task chains for provenance
//! queries.

use crate::audit::AuditSink;
use crate::error::Result;
use crate::store::TaskStore;
use crate::token::IssuedToken;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

/// Task record: a node in the task tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    /// Task identifier
    pub task_id: String,

    /// Parent task, if the task is a subtask
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
}

/// Task lineage verifier
pub struct TaskLineageVerifier {
    tasks: Arc<dyn TaskStore>,
    audit: Arc<dyn AuditSink>,
}

impl TaskLineageVerifier {
    /// Create a verifier
    pub fn new(tasks: Arc<dyn TaskStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { tasks, audit }
    }

    /// Check that a claimed lineage matches what is stored on the token.
    ///
    /// Returns `false` when a claimed task or parent-task id differs from
    /// the token's stored ids, or when the supplied parent token is not the
    /// token's actual parent. Prevents a caller from asserting a lineage
    /// relationship issuance never established.
    pub fn verify_task_lineage(
        &self,
        token: &IssuedToken,
        parent_token: Option<&IssuedToken>,
        task_id: Option<&str>,
        parent_task_id: Option<&str>,
    ) -> bool {
        if let Some(claimed) = task_id {
            if claimed != token.task_id {
                debug!(token_id = %token.id, claimed, "task id claim mismatch");
                return false;
            }
        }

        if let Some(claimed) = parent_task_id {
            if token.parent_task_id.as_deref() != Some(claimed) {
                debug!(token_id = %token.id, claimed, "parent task id claim mismatch");
                return false;
            }
        }

        if let Some(parent) = parent_token {
            if token.parent_token_id != Some(parent.id) {
                debug!(token_id = %token.id, parent_id = %parent.id, "parent token claim mismatch");
                return false;
            }
        }

        true
    }

    /// Reconstruct the ordered task chain containing `task_id`.
    ///
    /// Walks `parent_task_id` upward to the root with a visited-set cycle
    /// guard (a cycle is logged and the current node treated as root), then
    /// breadth-first over children to produce the ordered descendant list.
    /// A final best-effort pass scans audit-event details for chain member
    /// ids and appends tasks they reference; substring collisions make this
    /// enrichment advisory only.
    pub async fn task_chain(&self, task_id: &str) -> Result<Vec<String>> {
        let root = self.find_root(task_id).await?;

        // BFS over parent-pointer children.
        let mut chain: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<String> = VecDeque::from([root]);
        while let Some(current) = queue.pop_front() {
            if !seen.insert(current.clone()) {
                continue;
            }
            chain.push(current.clone());
            for child in self.tasks.children_of(&current).await? {
                queue.push_back(child.task_id);
            }
        }

        // Best-effort enrichment from audit details.
        let members: Vec<String> = chain.clone();
        for member in &members {
            for event in self.audit.events_mentioning(member).await {
                if let Some(related) = event.task_id {
                    if seen.insert(related.clone()) {
                        debug!(task_id = %related, via = %member, "task linked via audit details");
                        chain.push(related);
                    }
                }
            }
        }

        Ok(chain)
    }

    async fn find_root(&self, task_id: &str) -> Result<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut current = task_id.to_string();

        loop {
            if !visited.insert(current.clone()) {
                warn!(task_id = %current, "cycle detected in task lineage, treating as root");
                return Ok(current);
            }
            match self.tasks.get(&current).await? {
                Some(TaskRecord {
                    parent_task_id: Some(parent),
                    ..
                }) => current = parent,
                _ => return Ok(current),
            }
        }
    }
}
