use crate::model::*;

// ── Work-window algebra ─────────────────────────────────────────

/// Branch opening for one local day: working hours plus branch extra-openings,
/// minus branch blackouts. Empty when the branch is closed that day.
pub fn branch_window(
    hours: Option<Span>,
    branch_overrides: &[AvailabilityOverride],
    day: Span,
) -> Vec<Span> {
    let Some(hours) = hours else {
        return Vec::new();
    };
    apply_overrides(vec![hours], branch_overrides, day)
}

/// Effective window of one staff member: their schedule plus staff extra-openings,
/// clipped to the branch window, minus staff blackouts.
pub fn staff_window(
    schedule: Span,
    branch: &[Span],
    staff_overrides: &[AvailabilityOverride],
    day: Span,
) -> Vec<Span> {
    let (opens, blackouts) = split_overrides(staff_overrides, day);
    let mut own = opens;
    own.push(schedule);
    own.sort_by_key(|s| s.start);
    let own = merge_overlapping(&own);
    let clipped = intersect_all(&own, branch);
    subtract_intervals(&clipped, &blackouts)
}

fn apply_overrides(base: Vec<Span>, overrides: &[AvailabilityOverride], day: Span) -> Vec<Span> {
    let (opens, blackouts) = split_overrides(overrides, day);
    let mut free = base;
    free.extend(opens);
    free.sort_by_key(|s| s.start);
    let free = merge_overlapping(&free);
    subtract_intervals(&free, &blackouts)
}

/// Clamp overrides to `day` and split them into (extra-open, blackout), each sorted and merged.
fn split_overrides(overrides: &[AvailabilityOverride], day: Span) -> (Vec<Span>, Vec<Span>) {
    let mut opens = Vec::new();
    let mut blackouts = Vec::new();
    for ov in overrides {
        let Some(clamped) = ov.span.intersect(&day) else {
            continue;
        };
        if ov.available {
            opens.push(clamped);
        } else {
            blackouts.push(clamped);
        }
    }
    opens.sort_by_key(|s| s.start);
    blackouts.sort_by_key(|s| s.start);
    (merge_overlapping(&opens), merge_overlapping(&blackouts))
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end
        {
            last.end = last.end.max(span.end);
            continue;
        }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`; both sorted and disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut cursor = b.start;

        while ri < to_remove.len() && to_remove[ri].end <= cursor {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < b.end {
            let r = &to_remove[j];
            if r.start > cursor {
                result.push(Span::new(cursor, r.start));
            }
            cursor = cursor.max(r.end);
            j += 1;
        }

        if cursor < b.end {
            result.push(Span::new(cursor, b.end));
        }
    }

    result
}

/// Pairwise intersection of two sorted disjoint lists.
pub fn intersect_all(a: &[Span], b: &[Span]) -> Vec<Span> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if let Some(x) = a[i].intersect(&b[j]) {
            out.push(x);
        }
        if a[i].end < b[j].end {
            i += 1;
        } else {
            j += 1;
        }
    }
    out
}

/// True when `span` lies entirely inside one segment of `window`.
pub fn fits(window: &[Span], span: &Span) -> bool {
    window.iter().any(|w| w.contains_span(span))
}

/// Candidate starts: from each segment start, every `step` while `[t, t + len)` fits.
pub fn grid_starts(window: &[Span], len: Ms, step: Ms) -> Vec<Ms> {
    let mut out = Vec::new();
    if len <= 0 || step <= 0 {
        return out;
    }
    for seg in window {
        let mut t = seg.start;
        while t + len <= seg.end {
            out.push(t);
            t += step;
        }
    }
    out
}

/// True when `span` intersects any of `sorted` (sorted and merged).
pub fn hits_any(sorted: &[Span], span: &Span) -> bool {
    // First occupied interval ending after our start; anything earlier cannot overlap.
    let from = sorted.partition_point(|o| o.end <= span.start);
    sorted[from..]
        .iter()
        .take_while(|o| o.start < span.end)
        .any(|o| o.overlaps(span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    const H: Ms = HOUR_MS;
    const M: Ms = MINUTE_MS;

    fn ov(start: Ms, end: Ms, available: bool) -> AvailabilityOverride {
        AvailabilityOverride {
            id: Ulid::new(),
            scope: OverrideScope::Branch(Ulid::new()),
            span: Span::new(start, end),
            available,
            reason: None,
        }
    }

    fn day() -> Span {
        Span::new(0, 24 * H)
    }

    #[test]
    fn subtract_middle_punch() {
        let base = vec![Span::new(100, 300)];
        let remove = vec![Span::new(150, 200)];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![Span::new(100, 150), Span::new(200, 300)]
        );
    }

    #[test]
    fn subtract_full_and_partial() {
        let base = vec![Span::new(100, 200), Span::new(300, 400)];
        let remove = vec![Span::new(50, 250), Span::new(350, 450)];
        assert_eq!(subtract_intervals(&base, &remove), vec![Span::new(300, 350)]);
    }

    #[test]
    fn merge_adjacent() {
        let spans = vec![Span::new(100, 200), Span::new(200, 300), Span::new(400, 500)];
        assert_eq!(
            merge_overlapping(&spans),
            vec![Span::new(100, 300), Span::new(400, 500)]
        );
    }

    #[test]
    fn intersect_lists() {
        let a = vec![Span::new(0, 100), Span::new(200, 300)];
        let b = vec![Span::new(50, 250)];
        assert_eq!(
            intersect_all(&a, &b),
            vec![Span::new(50, 100), Span::new(200, 250)]
        );
    }

    #[test]
    fn closed_branch_has_empty_window() {
        assert!(branch_window(None, &[ov(0, H, true)], day()).is_empty());
    }

    #[test]
    fn branch_blackout_and_extra_opening() {
        let hours = Some(Span::new(9 * H, 17 * H));
        let overrides = [ov(12 * H, 13 * H, false), ov(17 * H, 19 * H, true)];
        assert_eq!(
            branch_window(hours, &overrides, day()),
            vec![Span::new(9 * H, 12 * H), Span::new(13 * H, 19 * H)]
        );
    }

    #[test]
    fn staff_window_clipped_to_branch() {
        let branch = vec![Span::new(9 * H, 17 * H)];
        let schedule = Span::new(8 * H, 18 * H);
        let overrides = [ov(10 * H, 11 * H, false)];
        assert_eq!(
            staff_window(schedule, &branch, &overrides, day()),
            vec![Span::new(9 * H, 10 * H), Span::new(11 * H, 17 * H)]
        );
    }

    #[test]
    fn staff_extra_opening_extends_within_branch() {
        let branch = vec![Span::new(9 * H, 19 * H)];
        let schedule = Span::new(9 * H, 13 * H);
        let overrides = [ov(15 * H, 20 * H, true)];
        assert_eq!(
            staff_window(schedule, &branch, &overrides, day()),
            vec![Span::new(9 * H, 13 * H), Span::new(15 * H, 19 * H)]
        );
    }

    #[test]
    fn grid_walk_stops_at_last_fitting_start() {
        let window = vec![Span::new(9 * H, 17 * H)];
        let starts = grid_starts(&window, 75 * M, 30 * M);
        assert_eq!(starts.len(), 14);
        assert_eq!(starts[0], 9 * H);
        assert_eq!(*starts.last().unwrap(), 15 * H + 30 * M);
    }

    #[test]
    fn grid_restarts_at_each_segment() {
        let window = vec![Span::new(0, 50 * M), Span::new(65 * M, 125 * M)];
        assert_eq!(grid_starts(&window, 30 * M, 30 * M), vec![0, 65 * M, 95 * M]);
    }

    #[test]
    fn hits_any_is_half_open() {
        let occupied = vec![Span::new(10 * H, 11 * H + 15 * M)];
        assert!(!hits_any(&occupied, &Span::new(8 * H + 45 * M, 10 * H)));
        assert!(hits_any(&occupied, &Span::new(9 * H, 10 * H + 15 * M)));
        assert!(!hits_any(&occupied, &Span::new(11 * H + 15 * M, 12 * H)));
    }
}
