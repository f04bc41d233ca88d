use crate::model::*;

/// Gaps inside `window` not covered by an active allocation of `resource`.
pub fn free_spans(resource: &ResourceState, window: &Span) -> Vec<Span> {
    let busy: Vec<Span> = resource
        .overlapping(window)
        .iter()
        .map(|a| Span::new(a.span.start.max(window.start), a.span.end.min(window.end)))
        .collect();
    subtract_intervals(&[*window], &busy)
}

/// Remove sorted `to_remove` spans from sorted, disjoint `base` spans.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < b.end {
            result.push(Span::new(current_start, b.end));
        }
    }

    result
}
