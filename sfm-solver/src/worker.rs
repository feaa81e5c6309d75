//! Data-parallel helpers over an explicit thread-pool handle.
//!
//! Entry points take `Option<&rayon::ThreadPool>`; `None` runs the work
//! inline on the caller's thread. Each worker receives a disjoint half-open
//! index range plus its thread index.

/// Splits `[0, total)` across the pool's workers. Each invocation receives
/// `(start, end, thread_index)`.
pub fn execute_range<F>(pool: Option<&rayon::ThreadPool>, total: usize, f: F)
where
    F: Fn(usize, usize, usize) + Sync,
{
    let Some(pool) = pool else {
        f(0, total, 0);
        return;
    };

    let threads = pool.current_num_threads().max(1).min(total.max(1));
    let chunk = total.div_ceil(threads);

    pool.scope(|scope| {
        for thread_index in 0..threads {
            let start = thread_index * chunk;
            let end = ((thread_index + 1) * chunk).min(total);
            if start >= end {
                break;
            }

            let f = &f;
            scope.spawn(move |_| f(start, end, thread_index));
        }
    });
}

/// Splits a mutable slice across the pool's workers; each worker fills its
/// own disjoint chunk, so no synchronization is required for the outputs.
/// The callback receives `(chunk, offset_of_chunk, thread_index)`.
pub fn execute_range_with<T, F>(pool: Option<&rayon::ThreadPool>, items: &mut [T], f: F)
where
    T: Send,
    F: Fn(&mut [T], usize, usize) + Sync,
{
    let total = items.len();

    let Some(pool) = pool else {
        f(items, 0, 0);
        return;
    };

    let threads = pool.current_num_threads().max(1).min(total.max(1));
    let chunk = total.div_ceil(threads);

    pool.scope(|scope| {
        let mut rest = items;
        let mut offset = 0usize;
        let mut thread_index = 0usize;

        while !rest.is_empty() {
            let take = chunk.min(rest.len());
            let (head, tail) = rest.split_at_mut(take);
            rest = tail;

            let f = &f;
            let start = offset;
            let index = thread_index;
            scope.spawn(move |_| f(head, start, index));

            offset += take;
            thread_index += 1;
        }
    });
}
