use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{EngineError, SharedResourceState};

pub type ResourceGuard = OwnedRwLockWriteGuard<ResourceState>;

/// The storage-level overlap rule fired.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("exclusion constraint violated on {resource_id}: {incoming} overlaps {existing}")]
pub struct ExclusionViolation {
    pub resource_id: String,
    pub incoming: Ulid,
    pub existing: Ulid,
}

/// In-memory index of allocations: resource id → sorted state, plus the
/// allocation id → resource id reverse lookup. Cancelled ids stay mapped.
pub struct Store {
    resources: DashMap<String, SharedResourceState>,
    entity_to_resource: DashMap<Ulid, String>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            resources: DashMap::new(),
            entity_to_resource: DashMap::new(),
        }
    }

    // ── Resources ────────────────────────────────────────────

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn get_resource(&self, id: &str) -> Option<SharedResourceState> {
        self.resources.get(id).map(|e| e.value().clone())
    }

    /// Resources come into existence on their first reservation.
    pub fn get_or_insert_resource(&self, id: &str) -> Result<SharedResourceState, EngineError> {
        if let Some(rs) = self.get_resource(id) {
            return Ok(rs);
        }
        if self.resources.len() >= MAX_RESOURCES_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many resources"));
        }
        let entry = self
            .resources
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(ResourceState::new(id.to_string()))));
        Ok(entry.value().clone())
    }

    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.resources.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    // ── Entity index ─────────────────────────────────────────

    pub fn get_resource_for_entity(&self, entity_id: &Ulid) -> Option<String> {
        self.entity_to_resource.get(entity_id).map(|e| e.value().clone())
    }

    // ── Exclusion constraint ─────────────────────────────────

    /// Storage backstop, independent of admission control. Active spans are
    /// disjoint and sorted, so only the neighbours of the insertion point can
    /// overlap `span`. `ignore` is skipped (the allocation being replaced).
    pub fn exclusion_violation(rs: &ResourceState, span: &Span, ignore: Option<Ulid>) -> Option<Ulid> {
        let pos = rs.insertion_point(span.start);
        let prev = rs.active[..pos].iter().rev().find(|a| Some(a.id) != ignore);
        if let Some(prev) = prev
            && prev.span.end > span.start
        {
            return Some(prev.id);
        }
        let next = rs.active[pos..].iter().find(|a| Some(a.id) != ignore);
        if let Some(next) = next
            && next.span.start < span.end
        {
            return Some(next.id);
        }
        None
    }

    /// Verify every allocation `event` would admit against the exclusion
    /// constraint. Nothing is modified.
    pub fn check(&self, guards: &[ResourceGuard], event: &Event) -> Result<(), ExclusionViolation> {
        let violation = |rs: &ResourceState, incoming: Ulid, existing: Ulid| ExclusionViolation {
            resource_id: rs.id.clone(),
            incoming,
            existing,
        };
        match event {
            Event::Reserved(a) => {
                if let Some(rs) = find_guard(guards, &a.resource_id)
                    && let Some(existing) = Self::exclusion_violation(rs, &a.span, None)
                {
                    return Err(violation(rs, a.id, existing));
                }
            }
            Event::Rescheduled { replaced, allocation } => {
                if let Some(rs) = find_guard(guards, &allocation.resource_id)
                    && let Some(existing) =
                        Self::exclusion_violation(rs, &allocation.span, Some(*replaced))
                {
                    return Err(violation(rs, allocation.id, existing));
                }
            }
            Event::ReservedBatch(allocs) => {
                for (i, a) in allocs.iter().enumerate() {
                    let Some(rs) = find_guard(guards, &a.resource_id) else {
                        continue;
                    };
                    if let Some(existing) = Self::exclusion_violation(rs, &a.span, None) {
                        return Err(violation(rs, a.id, existing));
                    }
                    if let Some(sibling) = allocs[..i]
                        .iter()
                        .find(|b| b.resource_id == a.resource_id && b.span.overlaps(&a.span))
                    {
                        return Err(violation(rs, a.id, sibling.id));
                    }
                }
            }
            Event::Cancelled { .. } => {}
        }
        Ok(())
    }

    // ── Event application ────────────────────────────────────

    /// Apply a checked event to the locked resources it touches.
    pub fn apply(&self, guards: &mut [ResourceGuard], event: &Event) {
        match event {
            Event::Reserved(a) => self.insert(guards, a),
            Event::ReservedBatch(allocs) => {
                for a in allocs {
                    self.insert(guards, a);
                }
            }
            Event::Cancelled { id, resource_id, at } => {
                if let Some(rs) = find_guard_mut(guards, resource_id) {
                    rs.cancel(*id, *at);
                }
            }
            Event::Rescheduled { replaced, allocation } => {
                if let Some(rs) = find_guard_mut(guards, &allocation.resource_id) {
                    rs.cancel(*replaced, allocation.created_at);
                }
                self.insert(guards, allocation);
            }
        }
    }

    fn insert(&self, guards: &mut [ResourceGuard], allocation: &Allocation) {
        if let Some(rs) = find_guard_mut(guards, &allocation.resource_id) {
            rs.insert_active(allocation.clone());
            self.entity_to_resource
                .insert(allocation.id, allocation.resource_id.clone());
        }
    }

    /// Write guards for replay. Resources are created as needed and are
    /// uncontended, so `try_write_owned` cannot block.
    pub fn replay_guards(&self, event: &Event) -> std::io::Result<Vec<ResourceGuard>> {
        let mut guards = Vec::new();
        for resource_id in event.resource_ids() {
            let rs = self
                .get_or_insert_resource(resource_id)
                .map_err(|e| std::io::Error::other(e.to_string()))?;
            let guard = rs
                .try_write_owned()
                .map_err(|_| std::io::Error::other("replay: resource locked"))?;
            guards.push(guard);
        }
        Ok(guards)
    }
}

fn find_guard<'a>(guards: &'a [ResourceGuard], resource_id: &str) -> Option<&'a ResourceState> {
    guards.iter().find(|g| g.id == resource_id).map(|g| &**g)
}

fn find_guard_mut<'a>(
    guards: &'a mut [ResourceGuard],
    resource_id: &str,
) -> Option<&'a mut ResourceState> {
    guards.iter_mut().find(|g| g.id == resource_id).map(|g| &mut **g)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alloc(resource: &str, start: Ms, end: Ms) -> Allocation {
        Allocation {
            id: Ulid::new(),
            resource_id: resource.into(),
            owner_id: "o".into(),
            span: Span::new(start, end),
            created_at: 0,
            status: AllocationStatus::Active,
            replaces: None,
        }
    }

    async fn guard(store: &Store, id: &str) -> ResourceGuard {
        store.get_or_insert_resource(id).unwrap().write_owned().await
    }

    #[tokio::test]
    async fn backstop_rejects_overlap_admission_missed() {
        let store = Store::new();
        let mut guards = vec![guard(&store, "desk-1").await];
        let first = alloc("desk-1", 100, 200);
        let event = Event::Reserved(first.clone());
        store.check(&guards, &event).unwrap();
        store.apply(&mut guards, &event);

        // Bypass admission control entirely.
        let overlapping = Event::Reserved(alloc("desk-1", 150, 160));
        let err = store.check(&guards, &overlapping).unwrap_err();
        assert_eq!(err.existing, first.id);
        assert_eq!(err.resource_id, "desk-1");
    }

    #[tokio::test]
    async fn backstop_checks_both_neighbours() {
        let store = Store::new();
        let mut guards = vec![guard(&store, "desk-1").await];
        let left = alloc("desk-1", 0, 100);
        let right = alloc("desk-1", 200, 300);
        for a in [&left, &right] {
            store.apply(&mut guards, &Event::Reserved(a.clone()));
        }

        assert_eq!(Store::exclusion_violation(&guards[0], &Span::new(50, 150), None), Some(left.id));
        assert_eq!(Store::exclusion_violation(&guards[0], &Span::new(150, 250), None), Some(right.id));
        assert_eq!(Store::exclusion_violation(&guards[0], &Span::new(200, 210), None), Some(right.id));
        assert_eq!(Store::exclusion_violation(&guards[0], &Span::new(100, 200), None), None);
    }

    #[tokio::test]
    async fn backstop_ignores_replaced_allocation() {
        let store = Store::new();
        let mut guards = vec![guard(&store, "desk-1").await];
        let old = alloc("desk-1", 100, 200);
        store.apply(&mut guards, &Event::Reserved(old.clone()));

        let mut moved = alloc("desk-1", 150, 250);
        moved.replaces = Some(old.id);
        moved.created_at = 7;
        let event = Event::Rescheduled { replaced: old.id, allocation: moved.clone() };
        store.check(&guards, &event).unwrap();
        store.apply(&mut guards, &event);

        assert_eq!(guards[0].active, vec![moved]);
        assert_eq!(guards[0].history[0].status, AllocationStatus::Cancelled { at: 7 });
    }

    #[tokio::test]
    async fn batch_siblings_must_not_overlap() {
        let store = Store::new();
        let guards = vec![guard(&store, "desk-1").await, guard(&store, "desk-2").await];
        let event = Event::ReservedBatch(vec![
            alloc("desk-1", 0, 100),
            alloc("desk-2", 50, 150),
            alloc("desk-1", 99, 120),
        ]);
        assert!(store.check(&guards, &event).is_err());

        let ok = Event::ReservedBatch(vec![alloc("desk-1", 0, 100), alloc("desk-2", 50, 150)]);
        assert!(store.check(&guards, &ok).is_ok());
    }

    #[tokio::test]
    async fn cancelled_ids_stay_resolvable() {
        let store = Store::new();
        let mut guards = vec![guard(&store, "desk-1").await];
        let a = alloc("desk-1", 0, 10);
        store.apply(&mut guards, &Event::Reserved(a.clone()));
        store.apply(
            &mut guards,
            &Event::Cancelled { id: a.id, resource_id: "desk-1".into(), at: 5 },
        );
        assert_eq!(store.get_resource_for_entity(&a.id).as_deref(), Some("desk-1"));
        assert!(guards[0].active.is_empty());
    }

    #[test]
    fn resources_created_lazily_once() {
        let store = Store::new();
        let a = store.get_or_insert_resource("desk-1").unwrap();
        let b = store.get_or_insert_resource("desk-1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(store.resource_count(), 1);
        assert_eq!(store.resource_ids(), vec!["desk-1".to_string()]);
    }
}
