use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::availability::free_spans;
use super::conflict::{validate_id, validate_window};
use super::{Engine, EngineError, ReplayReport};

/// Point-in-time counts for operator tooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub resources: usize,
    pub active: usize,
    pub cancelled: usize,
    #[serde(flatten)]
    pub replay: ReplayReport,
}

impl Engine {
    /// Active allocations on `resource_id` intersecting `[from, to)`, ordered
    /// by start. An unknown resource has none.
    pub async fn query(
        &self,
        resource_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Allocation>, EngineError> {
        let started = Instant::now();
        let result = self.query_inner(resource_id, from, to).await;
        observability::record("query", started, &result);
        result
    }

    async fn query_inner(
        &self,
        resource_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Allocation>, EngineError> {
        validate_id(resource_id, "missing resource id")?;
        let window = validate_window(to_ms(&from), to_ms(&to))?;
        Ok(match self.read_resource(resource_id).await? {
            Some(guard) => guard.overlapping(&window).to_vec(),
            None => Vec::new(),
        })
    }

    /// One allocation, active or cancelled.
    pub async fn get(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let resource_id = self
            .store
            .get_resource_for_entity(&id)
            .ok_or(EngineError::NotFound(id))?;
        let guard = self
            .read_resource(&resource_id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        guard.find(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Every allocation ever admitted on a resource, cancelled ones included,
    /// ordered by start.
    pub async fn history(&self, resource_id: &str) -> Result<Vec<Allocation>, EngineError> {
        let Some(guard) = self.read_resource(resource_id).await? else {
            return Ok(Vec::new());
        };
        let mut all: Vec<Allocation> = guard
            .history
            .iter()
            .chain(guard.active.iter())
            .cloned()
            .collect();
        all.sort_by_key(|a| (a.span.start, a.created_at));
        Ok(all)
    }

    /// Active allocations held by `owner_id` across all resources that
    /// intersect `[from, to)`, ordered by start.
    pub async fn owner_allocations(
        &self,
        owner_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Allocation>, EngineError> {
        validate_id(owner_id, "missing owner id")?;
        let window = validate_window(to_ms(&from), to_ms(&to))?;
        let mut found = Vec::new();
        for resource_id in self.store.resource_ids() {
            if let Some(guard) = self.read_resource(&resource_id).await? {
                found.extend(
                    guard
                        .overlapping(&window)
                        .iter()
                        .filter(|a| a.owner_id == owner_id)
                        .cloned(),
                );
            }
        }
        found.sort_by_key(|a| (a.span.start, a.resource_id.clone()));
        Ok(found)
    }

    /// The candidates with no active allocation intersecting `[from, to)`,
    /// in input order.
    pub async fn free_resources(
        &self,
        candidates: &[String],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<String>, EngineError> {
        if candidates.len() > MAX_IN_CLAUSE_IDS {
            return Err(EngineError::LimitExceeded("too many resource IDs"));
        }
        let window = validate_window(to_ms(&from), to_ms(&to))?;
        let mut free = Vec::new();
        for resource_id in candidates {
            let busy = match self.read_resource(resource_id).await? {
                Some(guard) => !guard.overlapping(&window).is_empty(),
                None => false,
            };
            if !busy {
                free.push(resource_id.clone());
            }
        }
        Ok(free)
    }

    /// Unallocated gaps of `resource_id` inside `[from, to)`.
    pub async fn free_spans(
        &self,
        resource_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Span>, EngineError> {
        let window = validate_window(to_ms(&from), to_ms(&to))?;
        Ok(match self.read_resource(resource_id).await? {
            Some(guard) => free_spans(&guard, &window),
            None => vec![window],
        })
    }

    /// Known resource ids, sorted.
    pub fn list_resources(&self) -> Vec<String> {
        self.store.resource_ids()
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        let mut stats = EngineStats {
            replay: self.replay_report(),
            ..EngineStats::default()
        };
        for resource_id in self.store.resource_ids() {
            if let Some(guard) = self.read_resource(&resource_id).await? {
                stats.resources += 1;
                stats.active += guard.active.len();
                stats.cancelled += guard.history.len();
            }
        }
        Ok(stats)
    }
}
