use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds (UTC), the internal time type. Public operations
/// take and return `DateTime<Utc>`.
pub type Ms = i64;

pub fn to_ms(t: &DateTime<Utc>) -> Ms {
    t.timestamp_millis()
}

/// Out-of-range values map to the epoch; stored spans are validated on admission.
pub fn from_ms(ms: Ms) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

pub fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationStatus {
    Active,
    /// Terminal. Kept for audit, ignored by overlap checks.
    Cancelled { at: Ms },
}

/// One desk booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub id: Ulid,
    pub resource_id: String,
    pub owner_id: String,
    pub span: Span,
    pub created_at: Ms,
    pub status: AllocationStatus,
    /// Set when this allocation superseded another through a reschedule.
    pub replaces: Option<Ulid>,
}

impl Allocation {
    pub fn is_active(&self) -> bool {
        matches!(self.status, AllocationStatus::Active)
    }

    pub fn start(&self) -> DateTime<Utc> {
        from_ms(self.span.start)
    }

    pub fn end(&self) -> DateTime<Utc> {
        from_ms(self.span.end)
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            AllocationStatus::Cancelled { at } => Some(from_ms(at)),
            AllocationStatus::Active => None,
        }
    }
}

/// Input row for `Engine::reserve_many`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveRequest {
    pub resource_id: String,
    pub owner_id: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResourceState {
    pub id: String,
    /// Active allocations, sorted by `span.start`. Pairwise disjoint, so also sorted by `span.end`.
    pub active: Vec<Allocation>,
    /// Cancelled allocations in cancellation order.
    pub history: Vec<Allocation>,
}

impl ResourceState {
    pub fn new(id: String) -> Self {
        Self {
            id,
            active: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn allocation_count(&self) -> usize {
        self.active.len() + self.history.len()
    }

    /// Index at which an allocation starting at `start` keeps `active` sorted.
    pub fn insertion_point(&self, start: Ms) -> usize {
        self.active
            .binary_search_by_key(&start, |a| a.span.start)
            .unwrap_or_else(|e| e)
    }

    /// Insert an active allocation maintaining sort order by span.start.
    /// The caller is responsible for the no-overlap check.
    pub fn insert_active(&mut self, allocation: Allocation) {
        let pos = self.insertion_point(allocation.span.start);
        self.active.insert(pos, allocation);
    }

    /// Move an active allocation into history. Returns the cancelled record.
    pub fn cancel(&mut self, id: Ulid, at: Ms) -> Option<&Allocation> {
        let pos = self.active.iter().position(|a| a.id == id)?;
        let mut allocation = self.active.remove(pos);
        allocation.status = AllocationStatus::Cancelled { at };
        self.history.push(allocation);
        self.history.last()
    }

    pub fn find(&self, id: Ulid) -> Option<&Allocation> {
        self.active
            .iter()
            .find(|a| a.id == id)
            .or_else(|| self.history.iter().find(|a| a.id == id))
    }

    /// Active allocations whose span overlaps the query window, in start order.
    /// Both bounds are binary searched since active spans are disjoint.
    pub fn overlapping(&self, query: &Span) -> &[Allocation] {
        let left = self.active.partition_point(|a| a.span.end <= query.start);
        let right = self.active.partition_point(|a| a.span.start < query.end);
        if left >= right {
            return &[];
        }
        &self.active[left..right]
    }
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Reserved(Allocation),
    /// All-or-nothing multi-booking, possibly across resources.
    ReservedBatch(Vec<Allocation>),
    Cancelled {
        id: Ulid,
        resource_id: String,
        at: Ms,
    },
    /// Cancels `replaced` and admits `allocation` as one record.
    Rescheduled {
        replaced: Ulid,
        allocation: Allocation,
    },
}

impl Event {
    /// Resources touched by this event.
    pub fn resource_ids(&self) -> Vec<&str> {
        match self {
            Event::Reserved(a) => vec![a.resource_id.as_str()],
            Event::ReservedBatch(allocs) => {
                let mut ids: Vec<&str> = allocs.iter().map(|a| a.resource_id.as_str()).collect();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
            Event::Cancelled { resource_id, .. } => vec![resource_id.as_str()],
            Event::Rescheduled { allocation, .. } => vec![allocation.resource_id.as_str()],
        }
    }
}
