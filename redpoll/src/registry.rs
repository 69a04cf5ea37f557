// Copyright (c) 2020-present, UMD Database Group.
//
// This program is free software: you can use, redistribute, and/or modify
// it under the terms of the GNU Affero General Public License, version 3
// or later ("AGPL"), as published by the Free Software Foundation.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <http://www.gnu.org/licenses/>.

//! The registry of in-flight queries.
//!
//! `QueryRegistry` maps the fingerprint of a query target to the server-side
//! identifier and status of the statement currently polled for it, so that a
//! cancel request issued later, from another place, can find the session.
//!
//! The registry is pure storage: entries are written by the looper callbacks
//! of the owning dispatcher and by [`QueryRegistry::mark_cancelled`].
//!
//! Every entry belongs to the session that last claimed it. Sessions polling
//! the same target share one entry; only its owner updates or removes it.

use crate::query::DataQuery;
use dashmap::DashMap;
use log::warn;

/// The lifecycle of a statement as seen by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing has been sent yet.
    NotStarted,
    /// The statement was accepted by the backend.
    Submitted,
    /// The statement is executing.
    Running,
    /// Partial results have been delivered.
    Streaming,
    /// The statement finished.
    Done,
    /// The statement failed or was aborted.
    Error,
}

impl Default for QueryStatus {
    fn default() -> Self {
        QueryStatus::NotStarted
    }
}

impl QueryStatus {
    /// Maps a backend status string onto the registry vocabulary.
    pub fn from_backend(status: &str) -> Self {
        match status.to_ascii_lowercase().as_str() {
            "started" | "submitted" | "picked" => QueryStatus::Submitted,
            "running" => QueryStatus::Running,
            "streaming" => QueryStatus::Streaming,
            "finished" | "done" => QueryStatus::Done,
            "failed" | "aborted" | "error" => QueryStatus::Error,
            _ => QueryStatus::NotStarted,
        }
    }

    /// Returns true if the statement may still produce results.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            QueryStatus::Submitted | QueryStatus::Running | QueryStatus::Streaming
        )
    }
}

/// The state of one in-flight query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningQueryInfo {
    /// The request id of the session polling the query.
    pub owner:            Option<String>,
    /// The server-side statement id, once the backend reported one.
    pub query_id:         Option<String>,
    /// The last known status.
    pub status:           QueryStatus,
    /// Set by an out-of-band cancel request.
    pub cancel_requested: bool,
}

/// A partial update of a [`RunningQueryInfo`]. Absent fields are left
/// untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunningQueryPatch {
    /// New statement id.
    pub query_id:         Option<String>,
    /// New status.
    pub status:           Option<QueryStatus>,
    /// New cancellation flag.
    pub cancel_requested: Option<bool>,
}

impl RunningQueryPatch {
    /// A patch that records the statement id.
    pub fn query_id(query_id: &str) -> Self {
        Self {
            query_id: Some(query_id.to_owned()),
            ..Default::default()
        }
    }

    /// A patch that records a status.
    pub fn status(status: QueryStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// A patch that requests cancellation.
    pub fn cancel() -> Self {
        Self {
            cancel_requested: Some(true),
            ..Default::default()
        }
    }

    /// Adds a status to the patch.
    pub fn with_status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn apply(self, info: &mut RunningQueryInfo) {
        if let Some(query_id) = self.query_id {
            info.query_id = Some(query_id);
        }
        if let Some(status) = self.status {
            info.status = status;
        }
        if let Some(cancel_requested) = self.cancel_requested {
            info.cancel_requested = cancel_requested;
        }
    }
}

/// In-flight queries keyed by target fingerprint.
#[derive(Debug, Default)]
pub struct QueryRegistry(DashMap<String, RunningQueryInfo>);

impl QueryRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        QueryRegistry(DashMap::new())
    }

    fn key(target: &DataQuery) -> String {
        match target.fingerprint() {
            Ok(key) => key,
            Err(e) => {
                warn!("Falling back to debug fingerprint for {}: {}", target.ref_id, e);
                format!("{:?}", target)
            }
        }
    }

    /// Hands the entry of `target` to the session `owner`, replacing whatever
    /// another session recorded for it.
    pub fn claim(&self, target: &DataQuery, owner: &str) {
        self.0.insert(Self::key(target), RunningQueryInfo {
            owner: Some(owner.to_owned()),
            ..Default::default()
        });
    }

    /// Merges the patch into the entry of `target`, creating it for `owner`
    /// if absent. An entry claimed by another session is left untouched.
    /// Returns true if the patch was applied.
    pub fn store(&self, target: &DataQuery, owner: &str, patch: RunningQueryPatch) -> bool {
        let mut entry = self.0.entry(Self::key(target)).or_insert_with(|| RunningQueryInfo {
            owner: Some(owner.to_owned()),
            ..Default::default()
        });
        if entry.owner.as_deref() != Some(owner) {
            return false;
        }
        patch.apply(entry.value_mut());
        true
    }

    /// Returns the entry of `target`, or the default state when none exists.
    pub fn get(&self, target: &DataQuery) -> RunningQueryInfo {
        self.0
            .get(&Self::key(target))
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    /// Deletes the entry of `target` if `owner` holds it. Deleting a missing
    /// entry is a no-op. Returns true if an entry was deleted.
    pub fn remove(&self, target: &DataQuery, owner: &str) -> bool {
        self.0
            .remove_if(&Self::key(target), |_, info| {
                info.owner.as_deref() == Some(owner)
            })
            .is_some()
    }

    /// Returns true if `owner` holds the entry of `target` and cancellation
    /// was requested for it.
    pub fn is_cancel_requested(&self, target: &DataQuery, owner: &str) -> bool {
        self.0
            .get(&Self::key(target))
            .map(|e| e.owner.as_deref() == Some(owner) && e.cancel_requested)
            .unwrap_or(false)
    }

    /// Requests cancellation of the query polled for `target`.
    ///
    /// Only an existing entry is updated: without an in-flight session there
    /// is nothing to cancel. Returns true if an entry was marked.
    pub fn mark_cancelled(&self, target: &DataQuery) -> bool {
        match self.0.get_mut(&Self::key(target)) {
            Some(mut entry) => {
                RunningQueryPatch::cancel().apply(entry.value_mut());
                true
            }
            None => false,
        }
    }

    /// Returns true if a query is registered for `target`.
    pub fn contains(&self, target: &DataQuery) -> bool {
        self.0.contains_key(&Self::key(target))
    }

    /// Returns the number of registered queries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if no query is registered.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use serde_json::json;

    #[test]
    fn store_merges_fields() {
        let registry = QueryRegistry::new();
        let target = DataQuery::new("A", "select 1");

        assert!(registry.store(&target, "s1", RunningQueryPatch::status(QueryStatus::Submitted)));
        assert!(registry.store(&target, "s1", RunningQueryPatch::query_id("q1")));
        assert_eq!(
            registry.get(&target),
            RunningQueryInfo {
                owner:            Some("s1".to_string()),
                query_id:         Some("q1".to_string()),
                status:           QueryStatus::Submitted,
                cancel_requested: false,
            }
        );

        registry.store(&target, "s1", RunningQueryPatch::cancel());
        registry.store(&target, "s1", RunningQueryPatch::status(QueryStatus::Running));
        let info = registry.get(&target);
        assert_eq!(info.query_id.as_deref(), Some("q1"));
        assert_eq!(info.status, QueryStatus::Running);
        assert!(info.cancel_requested);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_returns_default() {
        let registry = QueryRegistry::new();
        let target = DataQuery::new("A", "select 1");
        assert_eq!(registry.get(&target), RunningQueryInfo::default());
        assert!(!registry.contains(&target));
        assert!(!registry.is_cancel_requested(&target, "s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = QueryRegistry::new();
        let target = DataQuery::new("A", "select 1");
        registry.store(&target, "s1", RunningQueryPatch::query_id("q1"));
        assert!(registry.remove(&target, "s1"));
        assert!(!registry.remove(&target, "s1"));
        assert!(registry.is_empty());
    }

    #[test]
    fn claimed_entry_ignores_previous_owner() {
        let registry = QueryRegistry::new();
        let target = DataQuery::new("A", "select 1");
        registry.claim(&target, "s1");
        registry.store(&target, "s1", RunningQueryPatch::query_id("q1"));
        registry.mark_cancelled(&target);

        registry.claim(&target, "s2");
        assert_eq!(registry.get(&target).query_id, None);
        assert!(!registry.is_cancel_requested(&target, "s2"));

        assert!(!registry.store(&target, "s1", RunningQueryPatch::query_id("q9")));
        assert!(!registry.remove(&target, "s1"));
        assert!(registry.store(&target, "s2", RunningQueryPatch::query_id("q2")));
        assert_eq!(registry.get(&target).query_id.as_deref(), Some("q2"));

        registry.mark_cancelled(&target);
        assert!(registry.is_cancel_requested(&target, "s2"));
        assert!(!registry.is_cancel_requested(&target, "s1"));
        assert!(registry.remove(&target, "s2"));
        assert!(registry.is_empty());
    }

    #[test]
    fn same_fields_share_one_entry() -> Result<()> {
        let registry = QueryRegistry::new();
        let a: DataQuery =
            serde_json::from_value(json!({ "refId": "A", "rawSQL": "select 1", "alias": "x" }))?;
        let b: DataQuery =
            serde_json::from_value(json!({ "alias": "x", "rawSQL": "select 1", "refId": "A" }))?;

        registry.store(&a, "s1", RunningQueryPatch::query_id("q1"));
        registry.store(&b, "s1", RunningQueryPatch::query_id("q2"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(&a).query_id.as_deref(), Some("q2"));
        Ok(())
    }

    #[test]
    fn mark_cancelled_requires_entry() {
        let registry = QueryRegistry::new();
        let target = DataQuery::new("A", "select 1");

        assert!(!registry.mark_cancelled(&target));
        assert!(!registry.mark_cancelled(&target));
        assert!(registry.is_empty());

        registry.claim(&target, "s1");
        assert!(registry.mark_cancelled(&target));
        let once = registry.get(&target);
        assert!(registry.mark_cancelled(&target));
        assert_eq!(registry.get(&target), once);
        assert!(once.cancel_requested);
    }

    #[test]
    fn backend_statuses() {
        assert_eq!(QueryStatus::from_backend("SUBMITTED"), QueryStatus::Submitted);
        assert_eq!(QueryStatus::from_backend("started"), QueryStatus::Submitted);
        assert_eq!(QueryStatus::from_backend("running"), QueryStatus::Running);
        assert_eq!(QueryStatus::from_backend("FINISHED"), QueryStatus::Done);
        assert_eq!(QueryStatus::from_backend("aborted"), QueryStatus::Error);
        assert_eq!(QueryStatus::from_backend("whatever"), QueryStatus::NotStarted);
        assert!(QueryStatus::Running.is_active());
        assert!(!QueryStatus::Done.is_active());
    }
}
