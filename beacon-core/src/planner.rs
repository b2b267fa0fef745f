/// A contiguous run of content ids advertised as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchWindow {
    pub first: u64,
    pub count: u64,
}

/// Lazily yields the windows tiling `[0, highest]` for a fixed width.
///
/// Windows start at multiples of `width` and never move as `highest` grows;
/// only the last window's count changes and new windows get appended. When
/// `highest` sits on a width boundary the last window has a count of zero; it
/// is still emitted so that `highest` itself gets advertised.
#[derive(Debug, Clone)]
pub struct BatchPlan {
    highest: u64,
    width: u64,
    next_first: Option<u64>,
}

pub fn plan(highest: u64, width: u64) -> BatchPlan {
    BatchPlan {
        highest,
        width,
        next_first: (width > 0).then_some(0),
    }
}

impl Iterator for BatchPlan {
    type Item = BatchWindow;

    fn next(&mut self) -> Option<BatchWindow> {
        let first = self.next_first?;
        if first > self.highest {
            self.next_first = None;
            return None;
        }

        let count = self.width.min(self.highest - first);
        self.next_first = first.checked_add(self.width);

        Some(BatchWindow { first, count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn windows(highest: u64, width: u64) -> Vec<(u64, u64)> {
        plan(highest, width).map(|w| (w.first, w.count)).collect()
    }

    #[test]
    fn test_three_windows_for_sixty_thousand() {
        assert_eq!(
            windows(60_000, 25_000),
            vec![(0, 25_000), (25_000, 25_000), (50_000, 10_000)]
        );
    }

    #[test]
    fn test_growth_only_appends_windows() {
        let before = windows(60_000, 25_000);
        let after = windows(80_000, 25_000);

        assert_eq!(after.len(), 4);
        assert_eq!(after[3], (75_000, 5_000));
        for (old, new) in before.iter().zip(after.iter()) {
            assert_eq!(old.0, new.0);
        }
        assert_eq!(after[2], (50_000, 25_000));
    }

    #[test]
    fn test_boundary_window_is_emitted_with_zero_count() {
        let plan = windows(50_000, 25_000);
        assert_eq!(plan, vec![(0, 25_000), (25_000, 25_000), (50_000, 0)]);

        // a context keyed on the width still reaches content 50000
        assert!(
            plan.iter()
                .any(|&(first, _)| (first..first + 25_000).contains(&50_000))
        );
    }

    #[test]
    fn test_every_content_id_up_to_highest_is_covered() {
        for highest in [1, 999, 1_000, 1_001, 5_000] {
            let plan = windows(highest, 1_000);
            for id in [0, highest / 2, highest] {
                assert!(
                    plan.iter().any(|&(first, _)| (first..first + 1_000).contains(&id)),
                    "content id {} not covered for highest {}",
                    id,
                    highest
                );
            }
        }
    }

    #[test]
    fn test_degenerate_inputs() {
        assert_eq!(windows(0, 25_000), vec![(0, 0)]);
        assert!(windows(100, 0).is_empty());
        assert_eq!(windows(1, 25_000), vec![(0, 1)]);
        assert_eq!(
            windows(u64::MAX, u64::MAX / 2 + 1),
            vec![(0, u64::MAX / 2 + 1), (u64::MAX / 2 + 1, u64::MAX / 2)]
        );
    }

    #[test]
    fn test_plan_is_deterministic() {
        assert_eq!(windows(123_456, 1_000), windows(123_456, 1_000));
        assert_eq!(plan(123_456, 1_000).count(), 124);
    }
}
