use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_id(id: &str, what: &'static str) -> Result<(), EngineError> {
    if id.trim().is_empty() {
        return Err(EngineError::Validation(what));
    }
    if id.len() > MAX_ID_LEN {
        return Err(EngineError::LimitExceeded("identifier too long"));
    }
    Ok(())
}

/// Turn a pair of instants into a span, rejecting empty, inverted or out-of-range input.
pub(crate) fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation("start must be before end"));
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::Validation("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

pub(crate) fn validate_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if start >= end {
        return Err(EngineError::Validation("window start must be before end"));
    }
    if end - start > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(Span::new(start, end))
}

/// Admission check: every active allocation on `rs` that intersects `span`,
/// except `ignore` (the allocation being replaced by a reschedule).
pub(crate) fn conflicts(rs: &ResourceState, span: &Span, ignore: Option<Ulid>) -> Vec<Ulid> {
    rs.overlapping(span)
        .iter()
        .filter(|a| Some(a.id) != ignore)
        .map(|a| a.id)
        .collect()
}

pub(crate) fn check_no_conflict(
    rs: &ResourceState,
    span: &Span,
    ignore: Option<Ulid>,
) -> Result<(), EngineError> {
    let ids = conflicts(rs, span, ignore);
    if ids.is_empty() {
        Ok(())
    } else {
        Err(EngineError::Conflict(ids))
    }
}

/// Pairwise check of requests that will land on the same resource in one
/// batch. Batch members have no committed id yet, so an overlap is a
/// malformed request rather than a conflict.
pub(crate) fn check_batch_disjoint(batch: &[Span]) -> Result<(), EngineError> {
    let mut sorted: Vec<&Span> = batch.iter().collect();
    sorted.sort_by_key(|span| span.start);
    if sorted.windows(2).any(|pair| pair[0].overlaps(pair[1])) {
        return Err(EngineError::Validation("requests in batch overlap"));
    }
    Ok(())
}
