use std::num::NonZeroUsize;

use comms::specs::{Batch, Sample};

/// Splits `items` round-robin into exactly `n` shards.
///
/// The item at position `i` lands in shard `i % n`, relative order is kept inside each
/// shard. Shards are empty when there are fewer items than shards.
pub fn partition<T>(items: Vec<T>, n: NonZeroUsize) -> Vec<Vec<T>> {
    let n = n.get();
    let per_shard = items.len().div_ceil(n);

    let mut shards: Vec<Vec<T>> = (0..n).map(|_| Vec::with_capacity(per_shard)).collect();
    for (i, item) in items.into_iter().enumerate() {
        shards[i % n].push(item);
    }

    shards
}

/// Groups `samples` into batches of `batch_size`, the last one may be shorter.
pub fn into_batches(samples: Vec<Sample>, batch_size: NonZeroUsize) -> Vec<Batch> {
    let batch_size = batch_size.get();
    let mut batches = Vec::with_capacity(samples.len().div_ceil(batch_size));

    let mut samples = samples.into_iter().peekable();
    while samples.peek().is_some() {
        let batch = samples.by_ref().take(batch_size).collect();
        batches.push(Batch::new(batch));
    }

    batches
}
