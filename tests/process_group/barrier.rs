use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use muster::AllreduceOptions;

use super::helpers::run_ranks;

#[test]
fn test_barrier_completes_across_ranks() {
    run_ranks(2, 1, |_rank, pg, _backend| {
        let work = pg.barrier().unwrap();
        work.wait().unwrap();
        assert!(work.is_completed().unwrap());
    });
}

#[test]
fn test_barrier_orders_ranks() {
    // Every rank increments before the barrier; after it, all increments
    // must be visible everywhere.
    let arrived = Arc::new(AtomicUsize::new(0));
    let seen = arrived.clone();
    run_ranks(3, 1, move |_rank, pg, _backend| {
        arrived.fetch_add(1, Ordering::SeqCst);
        pg.barrier().unwrap().wait().unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    });
}

#[test]
fn test_barrier_reuses_devices_touched_by_collectives() {
    run_ranks(2, 2, |rank, pg, backend| {
        // Touch device 1 only, then barrier: it must run on device 1.
        let t = backend
            .tensor_from_slice(&[rank as f32], &[1], 1)
            .unwrap();
        pg.allreduce(std::slice::from_ref(&t), AllreduceOptions::default())
            .unwrap()
            .wait()
            .unwrap();
        let work = pg.barrier().unwrap();
        work.wait().unwrap();
        assert_eq!(work.devices(), &[1]);
    });
}
