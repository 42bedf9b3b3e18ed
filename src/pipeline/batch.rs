//! Page batching: split pages into contiguous, ordered groups.
//!
//! The same batcher serves extraction (groups of page images, size B) and
//! synthesis (groups of page records, size R). Batch size only changes the
//! grouping; page numbers always come from the items themselves.

use crate::error::AnalysisError;
use std::ops::RangeInclusive;

/// A contiguous run of 1-indexed pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Batch {
    /// 0-based position of this batch in the batch sequence.
    pub index: usize,
    pub first_page: usize,
    pub last_page: usize,
}

impl Batch {
    pub fn pages(&self) -> RangeInclusive<usize> {
        self.first_page..=self.last_page
    }

    pub fn len(&self) -> usize {
        self.last_page + 1 - self.first_page
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, page_num: usize) -> bool {
        self.pages().contains(&page_num)
    }

    pub fn page_numbers(&self) -> Vec<usize> {
        self.pages().collect()
    }
}

impl std::fmt::Display for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.first_page == self.last_page {
            write!(f, "page {}", self.first_page)
        } else {
            write!(f, "pages {}-{}", self.first_page, self.last_page)
        }
    }
}

/// Partition pages `1..=total_pages` into batches of at most `batch_size`.
///
/// Zero pages yield zero batches; a zero batch size is a validation error.
pub fn plan_batches(total_pages: usize, batch_size: usize) -> Result<Vec<Batch>, AnalysisError> {
    if batch_size == 0 {
        return Err(AnalysisError::Validation(
            "batch size must be a positive integer".into(),
        ));
    }
    let mut batches = Vec::with_capacity(total_pages.div_ceil(batch_size));
    let mut first = 1;
    while first <= total_pages {
        let last = (first + batch_size - 1).min(total_pages);
        batches.push(Batch {
            index: batches.len(),
            first_page: first,
            last_page: last,
        });
        first = last + 1;
    }
    Ok(batches)
}

/// Group an ordered item sequence into chunks of at most `batch_size`,
/// keeping each item's own page number via `page_of`.
///
/// Used where the items are already numbered (page images, page records):
/// the returned batch bounds come from the first and last item of each chunk.
pub fn batch_items<T, F>(
    items: &[T],
    batch_size: usize,
    page_of: F,
) -> Result<Vec<(Batch, &[T])>, AnalysisError>
where
    F: Fn(&T) -> usize,
{
    if batch_size == 0 {
        return Err(AnalysisError::Validation(
            "batch size must be a positive integer".into(),
        ));
    }
    Ok(items
        .chunks(batch_size)
        .enumerate()
        .filter_map(|(index, chunk)| {
            let first = chunk.first()?;
            let last = chunk.last()?;
            Some((
                Batch {
                    index,
                    first_page: page_of(first),
                    last_page: page_of(last),
                },
                chunk,
            ))
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn seven_pages_in_threes() {
        let batches = plan_batches(7, 3).unwrap();
        let ranges: Vec<_> = batches.iter().map(|b| (b.first_page, b.last_page)).collect();
        assert_eq!(ranges, vec![(1, 3), (4, 6), (7, 7)]);
        assert_eq!(batches[2].to_string(), "page 7");
        assert_eq!(batches[1].to_string(), "pages 4-6");
    }

    #[test]
    fn empty_input_yields_no_batches() {
        assert!(plan_batches(0, 3).unwrap().is_empty());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        assert!(matches!(plan_batches(5, 0), Err(AnalysisError::Validation(_))));
        let items = [1usize, 2];
        assert!(batch_items(&items, 0, |p| *p).is_err());
    }

    #[test]
    fn batches_cover_every_page_exactly_once() {
        for n in 0..40 {
            for b in 1..12 {
                let batches = plan_batches(n, b).unwrap();
                let mut seen = BTreeSet::new();
                let mut prev_last = 0;
                for batch in &batches {
                    assert!(batch.len() <= b, "n={n} b={b}: batch too large");
                    assert_eq!(batch.first_page, prev_last + 1, "n={n} b={b}: not contiguous");
                    prev_last = batch.last_page;
                    for p in batch.pages() {
                        assert!(seen.insert(p), "n={n} b={b}: page {p} repeated");
                    }
                }
                assert_eq!(seen, (1..=n).collect::<BTreeSet<_>>(), "n={n} b={b}");
            }
        }
    }

    #[test]
    fn batch_items_keeps_item_page_numbers() {
        let pages = [4usize, 5, 6, 9, 10];
        let groups = batch_items(&pages, 2, |p| *p).unwrap();
        assert_eq!(groups.len(), 3);
        assert_eq!((groups[0].0.first_page, groups[0].0.last_page), (4, 5));
        assert_eq!((groups[1].0.first_page, groups[1].0.last_page), (6, 9));
        assert_eq!(groups[2].1, &[10]);
    }
}
