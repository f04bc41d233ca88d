use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::{check_batch_disjoint, check_no_conflict, validate_id, validate_span};
use super::{Engine, EngineError, WalCommand};

/// Lock name reported when compaction cannot get exclusive access in time.
const COMPACTION_LOCK: &str = "wal-compaction";

fn check_capacity(rs: &ResourceState, adding: usize) -> Result<(), EngineError> {
    if rs.allocation_count() + adding > MAX_ALLOCATIONS_PER_RESOURCE {
        return Err(EngineError::LimitExceeded("too many allocations on resource"));
    }
    Ok(())
}

impl Engine {
    /// Admit `[start, end)` on `resource_id` for `owner_id` unless it overlaps an
    /// active allocation. Timestamps in other zones convert with `with_timezone(&Utc)`.
    pub async fn reserve(
        &self,
        resource_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        owner_id: &str,
    ) -> Result<Allocation, EngineError> {
        let started = Instant::now();
        let result = self.reserve_inner(resource_id, start, end, owner_id).await;
        observability::record("reserve", started, &result);
        result
    }

    async fn reserve_inner(
        &self,
        resource_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        owner_id: &str,
    ) -> Result<Allocation, EngineError> {
        validate_id(resource_id, "missing resource id")?;
        validate_id(owner_id, "missing owner id")?;
        let span = validate_span(to_ms(&start), to_ms(&end))?;

        let locked = self.lock_resources(&[resource_id]).await?;
        check_capacity(&locked.guards[0], 1)?;
        if let Err(e) = check_no_conflict(&locked.guards[0], &span, None) {
            debug!("reserve {resource_id} [{start}, {end}) refused: {e}");
            return Err(e);
        }

        let allocation = Allocation {
            id: Ulid::new(),
            resource_id: resource_id.to_string(),
            owner_id: owner_id.to_string(),
            span,
            created_at: now_ms(),
            status: AllocationStatus::Active,
            replaces: None,
        };
        self.persist_and_apply(locked, Event::Reserved(allocation.clone()))
            .await?;
        info!(
            "reserved {} on {resource_id} for {owner_id} [{start}, {end})",
            allocation.id
        );
        Ok(allocation)
    }

    /// Cancel an allocation. Cancelling twice is a no-op that returns the
    /// already-cancelled record.
    pub async fn cancel(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let started = Instant::now();
        let result = self.cancel_inner(id).await;
        observability::record("cancel", started, &result);
        result
    }

    async fn cancel_inner(&self, id: Ulid) -> Result<Allocation, EngineError> {
        let (resource_id, locked) = self.lock_for_entity(id).await?;
        let current = locked.guards[0].find(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            debug!("cancel {id}: already cancelled");
            return Ok(current);
        }

        let event = Event::Cancelled {
            id,
            resource_id: resource_id.clone(),
            at: now_ms(),
        };
        let locked = self.persist_and_apply(locked, event).await?;
        info!("cancelled {id} on {resource_id}");
        locked.guards[0].find(id).cloned().ok_or(EngineError::NotFound(id))
    }

    /// Move an active allocation to a new interval on the same resource. The old
    /// allocation is cancelled and a new one, pointing back through `replaces`,
    /// is admitted in the same WAL record. The old interval does not count as a
    /// conflict.
    pub async fn reschedule(
        &self,
        id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Allocation, EngineError> {
        let started = Instant::now();
        let result = self.reschedule_inner(id, start, end).await;
        observability::record("reschedule", started, &result);
        result
    }

    async fn reschedule_inner(
        &self,
        id: Ulid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Allocation, EngineError> {
        let span = validate_span(to_ms(&start), to_ms(&end))?;
        let (resource_id, locked) = self.lock_for_entity(id).await?;
        let current = locked.guards[0].find(id).cloned().ok_or(EngineError::NotFound(id))?;
        if !current.is_active() {
            return Err(EngineError::Cancelled(id));
        }
        check_capacity(&locked.guards[0], 1)?;
        check_no_conflict(&locked.guards[0], &span, Some(id))?;

        let allocation = Allocation {
            id: Ulid::new(),
            resource_id: resource_id.clone(),
            owner_id: current.owner_id,
            span,
            created_at: now_ms(),
            status: AllocationStatus::Active,
            replaces: Some(id),
        };
        let event = Event::Rescheduled {
            replaced: id,
            allocation: allocation.clone(),
        };
        self.persist_and_apply(locked, event).await?;
        info!("rescheduled {id} as {} on {resource_id} [{start}, {end})", allocation.id);
        Ok(allocation)
    }

    /// Atomically reserve several intervals, possibly on different resources.
    /// All-or-nothing: if any request is invalid or conflicts (with stored
    /// allocations or with another request of the batch), nothing is committed.
    pub async fn reserve_many(
        &self,
        requests: Vec<ReserveRequest>,
    ) -> Result<Vec<Allocation>, EngineError> {
        let started = Instant::now();
        let result = self.reserve_many_inner(requests).await;
        observability::record("reserve_many", started, &result);
        result
    }

    async fn reserve_many_inner(
        &self,
        requests: Vec<ReserveRequest>,
    ) -> Result<Vec<Allocation>, EngineError> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        if requests.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }

        let now = now_ms();
        let mut allocations = Vec::with_capacity(requests.len());
        for req in requests {
            validate_id(&req.resource_id, "missing resource id")?;
            validate_id(&req.owner_id, "missing owner id")?;
            let span = validate_span(to_ms(&req.start), to_ms(&req.end))?;
            allocations.push(Allocation {
                id: Ulid::new(),
                resource_id: req.resource_id,
                owner_id: req.owner_id,
                span,
                created_at: now,
                status: AllocationStatus::Active,
                replaces: None,
            });
        }

        let resource_ids: Vec<&str> = allocations.iter().map(|a| a.resource_id.as_str()).collect();
        let locked = self.lock_resources(&resource_ids).await?;

        let mut by_resource: HashMap<&str, Vec<Span>> = HashMap::new();
        for a in &allocations {
            by_resource
                .entry(a.resource_id.as_str())
                .or_default()
                .push(a.span);
        }
        for guard in &locked.guards {
            let Some(batch) = by_resource.get(guard.id.as_str()) else {
                continue;
            };
            check_capacity(guard, batch.len())?;
            for span in batch {
                check_no_conflict(guard, span, None)?;
            }
            check_batch_disjoint(batch)?;
        }

        let count = allocations.len();
        let locked = self
            .persist_and_apply(locked, Event::ReservedBatch(allocations.clone()))
            .await?;
        info!("reserved batch of {count} across {} resources", locked.guards.len());
        Ok(allocations)
    }

    /// Rewrite the WAL with the events needed to recreate current state,
    /// cancelled history included.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let Ok(_exclusive) =
            tokio::time::timeout(self.lock_timeout(), self.commit_gate.write()).await
        else {
            return Err(self.timed_out(COMPACTION_LOCK));
        };
        let mut events = Vec::new();
        for resource_id in self.store.resource_ids() {
            let Some(guard) = self.read_resource(&resource_id).await? else {
                continue;
            };
            // History first: a cancelled allocation may share its interval with
            // an active one, so replay must see the cancellation before the
            // active allocation is admitted.
            for a in &guard.history {
                let AllocationStatus::Cancelled { at } = a.status else {
                    continue;
                };
                let mut original = a.clone();
                original.status = AllocationStatus::Active;
                events.push(Event::Reserved(original));
                events.push(Event::Cancelled {
                    id: a.id,
                    resource_id: resource_id.clone(),
                    at,
                });
            }
            events.extend(guard.active.iter().cloned().map(Event::Reserved));
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        metrics::counter!(observability::WAL_COMPACTIONS_TOTAL).increment(1);
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
