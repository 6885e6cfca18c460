//! # Concurrency Tests
//!
//! Many contexts working on one store at once.

use std::collections::HashSet;
use std::thread;

use scstore_core::{Addr, Context, Iterator3, ScError, ScType, Storage, StorageConfig};

const THREADS: usize = 8;

fn storage() -> Storage {
    Storage::open(StorageConfig {
        max_loaded_segments: 16,
        event_workers: Some(2),
        ..StorageConfig::default()
    })
    .expect("open storage")
}

/// `arc_new` gives up on contention; callers retry.
fn arc_with_retry(storage: &Storage, ctx: &Context, begin: Addr, end: Addr) -> Addr {
    loop {
        match storage.arc_new(ctx, ScType::ARC_POS_CONST_PERM, begin, end) {
            Err(ScError::Error) => thread::yield_now(),
            result => return result.expect("arc_new"),
        }
    }
}

#[test]
fn parallel_allocation_hands_out_distinct_addresses() {
    let storage = &storage();
    let per_thread = 3000;

    let all: Vec<Addr> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(move || {
                    let ctx = storage.full_context();
                    (0..per_thread)
                        .map(|_| storage.node_new(&ctx, ScType::CONST).expect("node"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().expect("worker panicked"))
            .collect()
    });

    let unique: HashSet<Addr> = all.iter().copied().collect();
    assert_eq!(unique.len(), THREADS * per_thread);
    assert!(!unique.contains(&Addr::EMPTY));

    let ctx = storage.full_context();
    let stat = storage.get_elements_stat(&ctx).expect("stat");
    assert_eq!(stat.nodes, (THREADS * per_thread) as u64);
}

#[test]
fn parallel_arcs_on_a_shared_hub() {
    let storage = &storage();
    let hub = {
        let ctx = storage.full_context();
        storage.node_new(&ctx, ScType::CONST).expect("hub")
    };
    let per_thread = 200;

    let created: Vec<Addr> = thread::scope(|scope| {
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                scope.spawn(move || {
                    let ctx = storage.full_context();
                    (0..per_thread)
                        .map(|_| {
                            let leaf = storage.node_new(&ctx, ScType::CONST).expect("leaf");
                            arc_with_retry(storage, &ctx, hub, leaf)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|w| w.join().expect("worker panicked"))
            .collect()
    });

    let ctx = storage.full_context();
    let walked: HashSet<Addr> =
        Iterator3::f_a_a(storage, &ctx, hub, ScType::UNKNOWN, ScType::UNKNOWN)
            .expect("iterator")
            .map(|[_, arc, _]| arc)
            .collect();
    let expected: HashSet<Addr> = created.into_iter().collect();
    assert_eq!(walked.len(), THREADS * per_thread);
    assert_eq!(walked, expected);
}

#[test]
fn iteration_while_arcs_are_deleted() {
    let storage = storage();
    let ctx = storage.full_context();
    let hub = storage.node_new(&ctx, ScType::CONST).expect("hub");
    let arcs: Vec<Addr> = (0..500)
        .map(|_| {
            let leaf = storage.node_new(&ctx, ScType::CONST).expect("leaf");
            arc_with_retry(&storage, &ctx, hub, leaf)
        })
        .collect();

    let (shared, doomed) = (&storage, &arcs);
    thread::scope(|scope| {
        scope.spawn(move || {
            let ctx = shared.full_context();
            for &arc in doomed.iter().step_by(2) {
                shared.element_free(&ctx, arc).expect("free");
            }
        });
        for _ in 0..4 {
            scope.spawn(move || {
                let ctx = shared.full_context();
                for _ in 0..20 {
                    let it = Iterator3::f_a_a(shared, &ctx, hub, ScType::UNKNOWN, ScType::UNKNOWN)
                        .expect("iterator");
                    for [begin, _, _] in it {
                        assert_eq!(begin, hub);
                    }
                }
            });
        }
    });

    let remaining: HashSet<Addr> =
        Iterator3::f_a_a(&storage, &ctx, hub, ScType::UNKNOWN, ScType::UNKNOWN)
            .expect("iterator")
            .map(|[_, arc, _]| arc)
            .collect();
    let expected: HashSet<Addr> = arcs.iter().skip(1).step_by(2).copied().collect();
    assert_eq!(remaining, expected);
    for &arc in arcs.iter().step_by(2) {
        assert!(!storage.is_element(&ctx, arc));
    }
}

#[test]
fn concurrent_deletions_of_overlapping_closures() {
    let storage = storage();
    let ctx = storage.full_context();
    let nodes: Vec<Addr> = (0..64)
        .map(|_| storage.node_new(&ctx, ScType::CONST).expect("node"))
        .collect();
    for pair in nodes.windows(2) {
        arc_with_retry(&storage, &ctx, pair[0], pair[1]);
    }

    let storage = &storage;
    thread::scope(|scope| {
        for chunk in nodes.chunks(nodes.len() / 4) {
            scope.spawn(move || {
                let ctx = storage.full_context();
                for &node in chunk {
                    storage.element_free(&ctx, node).expect("free");
                }
            });
        }
    });

    let stat = storage.get_elements_stat(&ctx).expect("stat");
    assert_eq!((stat.nodes, stat.arcs), (0, 0));
}
