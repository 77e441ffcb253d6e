//! Bounded worker pool for independent work items
//!
//! Trace-file parsing and per-compiler-call preprocessing are both
//! embarrassingly parallel; the pool maps a function over a batch of items
//! with a fixed number of OS threads. With one worker everything runs on the
//! calling thread, matching the sequential default.

use crossbeam::channel;

/// Map `f` over `items` using `workers` threads.
///
/// Results are returned in completion order, not input order. Callers that
/// need a stable order must sort afterwards.
pub fn map<T, R, F>(items: Vec<T>, workers: usize, f: F) -> Vec<R>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    if workers <= 1 || items.len() <= 1 {
        return items.into_iter().map(f).collect();
    }

    let (work_tx, work_rx) = channel::unbounded();
    let (result_tx, result_rx) = channel::unbounded();
    let expected = items.len();
    for item in items {
        // Send cannot fail while the receiver is alive in this scope.
        let _ = work_tx.send(item);
    }
    drop(work_tx);

    std::thread::scope(|scope| {
        for worker in 0..workers {
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let f = &f;
            std::thread::Builder::new()
                .name(format!("worker-{worker}"))
                .spawn_scoped(scope, move || {
                    for item in work_rx.iter() {
                        if result_tx.send(f(item)).is_err() {
                            break;
                        }
                    }
                })
                .expect("spawning a pool worker");
        }
        drop(result_tx);
        result_rx.iter().take(expected).collect()
    })
}

/// The `worker-N` suffix of the current thread, if it is a pool thread
pub fn current_worker() -> Option<String> {
    std::thread::current().name().and_then(|name| {
        name.starts_with("worker-").then(|| name.to_string())
    })
}
