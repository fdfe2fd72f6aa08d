use crate::model::PreviewRow;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Merges per-task previews, each sorted by time, into one time-ordered list of
/// at most `limit` rows.
pub fn merge_previews(sequences: Vec<Vec<PreviewRow>>, limit: usize) -> Vec<PreviewRow> {
    let mut sources: Vec<_> = sequences.into_iter().map(Vec::into_iter).collect();
    let mut heads: Vec<Option<PreviewRow>> = Vec::with_capacity(sources.len());
    let mut heap = BinaryHeap::with_capacity(sources.len());

    for (index, source) in sources.iter_mut().enumerate() {
        let head = source.next();
        if let Some(row) = &head {
            heap.push(Reverse((row.time, index)));
        }
        heads.push(head);
    }

    let mut merged = Vec::with_capacity(limit.min(heads.len() * 16));
    while merged.len() < limit {
        let Some(Reverse((_, index))) = heap.pop() else {
            break;
        };
        let Some(row) = heads[index].take() else {
            continue;
        };
        merged.push(row);

        if let Some(next) = sources[index].next() {
            heap.push(Reverse((next.time, index)));
            heads[index] = Some(next);
        }
    }
    merged
}
