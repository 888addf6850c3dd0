//! Range computation for closing every descriptor but a shielded set.

/// Descriptor ranges `[a, b)` covering `[start, stop)` minus `exclude`.
///
/// The ranges are ascending, disjoint and never empty. Shielded values
/// outside `[start, stop)` are ignored. Example: `start=3, stop=7,
/// exclude={4}` gives `[(3, 4), (5, 7)]`.
pub(crate) fn make_ranges<I>(start: i32, stop: i32, exclude: I) -> Vec<(i32, i32)>
where
    I: IntoIterator<Item = i32>,
{
    let mut exclude: Vec<i32> = exclude
        .into_iter()
        .filter(|fd| *fd >= start && *fd < stop)
        .collect();
    exclude.sort_unstable();

    let mut ranges = Vec::with_capacity(exclude.len() + 1);
    let mut seeker = start;
    for fd in exclude {
        if seeker < fd {
            ranges.push((seeker, fd));
        }
        // Duplicates leave seeker where it is.
        seeker = fd + 1;
    }

    if seeker < stop {
        ranges.push((seeker, stop));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    #[test]
    fn known_ranges() {
        assert_eq!(make_ranges(0, 5, []), vec![(0, 5)]);
        assert_eq!(make_ranges(3, 10, [1, 2]), vec![(3, 10)]);
        assert_eq!(make_ranges(3, 7, [4]), vec![(3, 4), (5, 7)]);
        assert_eq!(
            make_ranges(3, 14, [4, 5, 10]),
            vec![(3, 4), (6, 10), (11, 14)]
        );
        assert_eq!(make_ranges(1, 3, [1, 2, 3]), vec![]);
        assert_eq!(make_ranges(1, 3, [1, 2]), vec![]);
        assert_eq!(make_ranges(1, 3, [1]), vec![(2, 3)]);
    }

    #[test]
    fn shield_past_stop_does_not_extend_range() {
        assert_eq!(make_ranges(3, 7, [10]), vec![(3, 7)]);
    }

    #[test]
    fn duplicate_shields() {
        assert_eq!(make_ranges(3, 8, [5, 5, 5]), vec![(3, 5), (6, 8)]);
    }

    proptest! {
        #[test]
        fn ranges_cover_exactly_the_unshielded(
            start in 0i32..64,
            len in 0i32..128,
            exclude in proptest::collection::vec(0i32..256, 0..32),
        ) {
            let stop = start + len;
            let ranges = make_ranges(start, stop, exclude.iter().copied());

            let mut covered = BTreeSet::new();
            let mut last_end = i32::MIN;
            for (a, b) in &ranges {
                prop_assert!(a < b);
                prop_assert!(*a > last_end);
                last_end = *b;
                covered.extend(*a..*b);
            }

            let shielded: BTreeSet<i32> = exclude.into_iter().collect();
            let expected: BTreeSet<i32> =
                (start..stop).filter(|fd| !shielded.contains(fd)).collect();
            prop_assert_eq!(covered, expected);
        }
    }
}
