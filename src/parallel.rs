use std::panic;
use std::thread;

/// Applies `f` to every item on up to `n_jobs` worker threads.
///
/// Workers pull `(index, item)` jobs from a shared queue. Results are placed
/// by index, so the output does not depend on scheduling. The scope end acts
/// as the barrier: no result is visible before every worker has finished.
pub fn map<T, R, F>(items: &[T], n_jobs: usize, f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync,
{
    if n_jobs <= 1 || items.len() <= 1 {
        return items.iter().enumerate().map(|(i, x)| f(i, x)).collect();
    }
    let (s, r) = crossbeam_channel::unbounded();
    for job in items.iter().enumerate() {
        // the receiver outlives every send
        let _ = s.send(job);
    }
    drop(s);

    let mut results: Vec<Option<R>> = items.iter().map(|_| None).collect();
    thread::scope(|scope| {
        let mut threads = vec![];
        for _ in 0..n_jobs.min(items.len()) {
            let t = scope.spawn(|| {
                let mut local = vec![];
                while let Ok((i, item)) = r.try_recv() {
                    local.push((i, f(i, item)));
                }
                local
            });
            threads.push(t);
        }
        for t in threads {
            match t.join() {
                Ok(local) => {
                    for (i, v) in local {
                        results[i] = Some(v);
                    }
                }
                Err(e) => panic::resume_unwind(e),
            }
        }
    });
    results.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_is_kept() {
        let items: Vec<usize> = (0..100).collect();
        let sequential = map(&items, 1, |i, &x| i * 1000 + x * x);
        let parallel = map(&items, 4, |i, &x| i * 1000 + x * x);
        assert_eq!(sequential, parallel);
        assert_eq!(99 * 1000 + 99 * 99, parallel[99]);
    }

    #[test]
    fn test_more_jobs_than_items() {
        let items = [3, 1, 2];
        assert_eq!(vec![6, 2, 4], map(&items, 16, |_, &x| x * 2));
        assert!(map(&[] as &[usize], 4, |_, &x| x).is_empty());
    }
}
