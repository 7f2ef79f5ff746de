//! Demo workload for causalprof.
//!
//! Two worker roles share a queue of requests: hashing dominates the run
//! time, bookkeeping barely registers. A causal profile should show that
//! speeding up the hashing loop moves end-to-end throughput while the
//! bookkeeping line does not.
//!
//! Build: cargo build --release -p causalprof-demo
//! Run:   CAUSALPROF_OUTPUT=profile.causal ./target/release/causalprof-demo
//!
//! Pin a round to one line for an end-to-end validation run:
//!   CAUSALPROF_FIXED_LINE=hashing.rs:10 CAUSALPROF_FIXED_SPEEDUP=50 \
//!     ./target/release/causalprof-demo

mod hashing;
mod ledger;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn main() {
    if let Err(e) = causalprof::startup(causalprof::Config::from_env()) {
        eprintln!("profiler startup failed: {}", e);
    }

    let processed = Arc::new(AtomicU64::new(0));
    let deadline = Instant::now() + Duration::from_secs(10);

    let workers: Vec<_> = (0..2)
        .map(|seed| {
            let processed = Arc::clone(&processed);
            causalprof::spawn(move || {
                let mut ledger = ledger::Ledger::new();
                let mut request = seed as u64;

                while Instant::now() < deadline {
                    let digest = hashing::digest(request);
                    ledger.record(request, digest);
                    processed.fetch_add(1, Ordering::Relaxed);
                    request = request.wrapping_add(2);
                }

                ledger.entries()
            })
        })
        .collect();

    let mut total_entries = 0usize;
    for worker in workers {
        total_entries += worker.join().unwrap();
    }

    causalprof::shutdown();

    println!(
        "processed {} requests ({} ledger entries)",
        processed.load(Ordering::Relaxed),
        total_entries
    );
}
