use std::sync::Arc;

use muster::{Fabric, HashStore, HostBackend, ProcessGroup, ProcessGroupOptions, Store};

pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Run `f` on every rank of an in-process cluster: one thread per rank,
/// each with its own backend over a shared fabric and store. Blocking wait
/// is on so plain `wait()` calls are deterministic.
pub fn run_ranks<F>(world_size: usize, devices_per_rank: usize, f: F)
where
    F: Fn(usize, ProcessGroup<HostBackend>, Arc<HostBackend>) + Send + Sync + 'static,
{
    let options = ProcessGroupOptions::default().with_blocking_wait(true);
    run_ranks_with(world_size, devices_per_rank, options, Arc::new(HashStore::new()), f);
}

pub fn run_ranks_with<F>(
    world_size: usize,
    devices_per_rank: usize,
    options: ProcessGroupOptions,
    store: Arc<HashStore>,
    f: F,
) where
    F: Fn(usize, ProcessGroup<HostBackend>, Arc<HostBackend>) + Send + Sync + 'static,
{
    init_tracing();
    let fabric = Fabric::new();
    let f = Arc::new(f);
    let mut handles = Vec::new();
    for rank in 0..world_size {
        let fabric = fabric.clone();
        let store: Arc<dyn Store> = store.clone();
        let options = options.clone();
        let f = Arc::clone(&f);
        handles.push(
            std::thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    let backend = Arc::new(HostBackend::with_fabric(devices_per_rank, fabric));
                    let pg = ProcessGroup::new(
                        Arc::clone(&backend),
                        store,
                        rank,
                        world_size,
                        options,
                    )
                    .unwrap();
                    f(rank, pg, backend);
                })
                .unwrap(),
        );
    }
    for h in handles {
        h.join().unwrap();
    }
}
