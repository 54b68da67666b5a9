//! Background communicator watchdog.
//!
//! A dedicated thread scans the communicator cache for asynchronous vendor
//! errors, aborts erroring groups locally, publishes their ids to the store,
//! and symmetrically aborts any communicator whose abort marker a peer has
//! published. The watchdog never raises to callers: it mutates communicator
//! state, writes the store, and logs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::Backend;
use crate::comm::aborted_comm_store_key;
use crate::error::Result;
use crate::process_group::Shared;
use crate::store::lock;

/// Upper bound on one store poll for a peer's abort marker.
pub(crate) const STORE_WAIT: Duration = Duration::from_secs(1);

pub(crate) fn spawn<B: Backend>(shared: Arc<Shared<B>>) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("muster-watchdog".into())
        .spawn(move || match run(&shared) {
            Ok(()) => tracing::debug!("watchdog terminated normally"),
            Err(e) => tracing::error!(error = %e, "watchdog terminated with error"),
        })
        .expect("spawning watchdog thread")
}

fn run<B: Backend>(shared: &Shared<B>) -> Result<()> {
    loop {
        if is_terminated(shared) {
            return Ok(());
        }

        let mut aborted_this_tick: HashSet<String> = HashSet::new();
        let mut all_ids: HashSet<String> = HashSet::new();

        {
            let mut state = lock(&shared.cache.state);
            for comms in state.comms_by_key.values() {
                for comm in comms {
                    all_ids.insert(comm.id_hex());
                }
                let error = comms.iter().find_map(|c| c.async_error(&shared.backend));
                if let Some(message) = error {
                    tracing::info!(error = %message, "asynchronous error on cached communicator group");
                    // Non-blocking mode leaves the communicators alone: an
                    // abort would let wait() return without raising and
                    // subsequent work would run on garbage results.
                    if shared.options.blocking_wait {
                        for comm in comms {
                            comm.abort(&shared.backend);
                            aborted_this_tick.insert(comm.id_hex());
                        }
                    }
                }
            }
            // Aborted communicators stay cached: dropping them would let a
            // surviving rank's next collective mint a colliding fresh
            // communicator while peers still block on the old one.
            for id in &aborted_this_tick {
                state.aborted_ids.insert(id.clone());
            }
        }

        if shared.options.blocking_wait {
            for id in &aborted_this_tick {
                let store_key = aborted_comm_store_key(id);
                shared.store.set(&store_key, &[])?;
                tracing::info!(key = %store_key, "watchdog wrote aborted communicator id to store");
            }

            let already_aborted = lock(&shared.cache.state).aborted_ids.clone();
            for id in all_ids.difference(&already_aborted) {
                let store_key = aborted_comm_store_key(id);
                match shared.store.wait(&[&store_key], STORE_WAIT) {
                    Ok(()) => {
                        tracing::info!(
                            key = %store_key,
                            "found abort marker in store, aborting matching communicators"
                        );
                        let comms = {
                            let mut state = lock(&shared.cache.state);
                            state.aborted_ids.insert(id.clone());
                            state.comms_by_id.get(id).cloned()
                        };
                        match comms {
                            Some(comms) => {
                                for comm in &comms {
                                    comm.abort(&shared.backend);
                                }
                            }
                            None => tracing::warn!(
                                id = %id,
                                "abort marker for a communicator missing from the reverse index"
                            ),
                        }
                    }
                    Err(_) => {
                        tracing::trace!(key = %store_key, "no abort marker in store");
                    }
                }
            }
        }

        if sleep_or_terminate(shared) {
            return Ok(());
        }
    }
}

fn is_terminated<B: Backend>(shared: &Shared<B>) -> bool {
    *lock(&shared.terminate)
}

/// Sleep one tick, waking early on termination. Returns whether the
/// watchdog should exit.
fn sleep_or_terminate<B: Backend>(shared: &Shared<B>) -> bool {
    let terminated = lock(&shared.terminate);
    let (guard, _result) = shared
        .terminate_cv
        .wait_timeout_while(terminated, shared.options.watchdog_tick, |t| !*t)
        .unwrap_or_else(|e| e.into_inner());
    *guard
}
