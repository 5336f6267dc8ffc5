#[cfg(feature = "metrics")]
mod imp {
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
    use std::time::Duration;

    use tracing::info;

    // Lifecycle (cumulative counts)
    static ACCEPTED: AtomicU64 = AtomicU64::new(0);
    static CLOSED: AtomicU64 = AtomicU64::new(0);
    static ACCEPT_ERRORS: AtomicU64 = AtomicU64::new(0);
    static POOL_EXHAUSTED: AtomicU64 = AtomicU64::new(0);
    // Throughput (cumulative)
    static BYTES_RECEIVED: AtomicU64 = AtomicU64::new(0);
    static BYTES_SENT: AtomicU64 = AtomicU64::new(0);
    // Gauges
    static ACTIVE: AtomicUsize = AtomicUsize::new(0);
    static MAX_ACTIVE: AtomicUsize = AtomicUsize::new(0);

    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub closed: u64,
        pub accept_errors: u64,
        pub pool_exhausted: u64,
        pub bytes_received: u64,
        pub bytes_sent: u64,
        pub active: usize,
        pub max_active: usize,
    }

    fn update_max(target: &AtomicUsize, value: usize) {
        let mut prev = target.load(Ordering::Relaxed);
        while value > prev {
            match target.compare_exchange_weak(prev, value, Ordering::Relaxed, Ordering::Relaxed) {
                Ok(_) => break,
                Err(next) => prev = next,
            }
        }
    }

    pub fn inc_accepted() {
        ACCEPTED.fetch_add(1, Ordering::Relaxed);
        let v = ACTIVE.fetch_add(1, Ordering::Relaxed) + 1;
        update_max(&MAX_ACTIVE, v);
    }

    pub fn inc_closed() {
        CLOSED.fetch_add(1, Ordering::Relaxed);
        ACTIVE.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_accept_errors() {
        ACCEPT_ERRORS.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_pool_exhausted() {
        POOL_EXHAUSTED.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes_received(n: usize) {
        BYTES_RECEIVED.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_bytes_sent(n: usize) {
        BYTES_SENT.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: ACCEPTED.load(Ordering::Relaxed),
            closed: CLOSED.load(Ordering::Relaxed),
            accept_errors: ACCEPT_ERRORS.load(Ordering::Relaxed),
            pool_exhausted: POOL_EXHAUSTED.load(Ordering::Relaxed),
            bytes_received: BYTES_RECEIVED.load(Ordering::Relaxed),
            bytes_sent: BYTES_SENT.load(Ordering::Relaxed),
            active: ACTIVE.load(Ordering::Relaxed),
            max_active: MAX_ACTIVE.load(Ordering::Relaxed),
        }
    }

    pub fn spawn_reporter() {
        const INTERVAL_SECS: u64 = 10;
        std::thread::spawn(|| {
            let mut last_snap = snapshot();
            loop {
                std::thread::sleep(Duration::from_secs(INTERVAL_SECS));
                let snap = snapshot();
                info!(
                    interval_secs = INTERVAL_SECS,
                    accepted = snap.accepted.saturating_sub(last_snap.accepted),
                    closed = snap.closed.saturating_sub(last_snap.closed),
                    accept_errors = snap.accept_errors.saturating_sub(last_snap.accept_errors),
                    pool_exhausted = snap.pool_exhausted.saturating_sub(last_snap.pool_exhausted),
                    bytes_received = snap.bytes_received.saturating_sub(last_snap.bytes_received),
                    bytes_sent = snap.bytes_sent.saturating_sub(last_snap.bytes_sent),
                    active = snap.active,
                    max_active = snap.max_active,
                    "metrics delta"
                );
                last_snap = snap;
            }
        });
    }
}

#[cfg(not(feature = "metrics"))]
#[allow(dead_code)]
mod imp {
    #[derive(Clone, Copy)]
    pub struct MetricsSnapshot {
        pub accepted: u64,
        pub closed: u64,
        pub accept_errors: u64,
        pub pool_exhausted: u64,
        pub bytes_received: u64,
        pub bytes_sent: u64,
        pub active: usize,
        pub max_active: usize,
    }

    pub fn inc_accepted() {}
    pub fn inc_closed() {}
    pub fn inc_accept_errors() {}
    pub fn inc_pool_exhausted() {}
    pub fn add_bytes_received(_: usize) {}
    pub fn add_bytes_sent(_: usize) {}
    pub fn snapshot() -> MetricsSnapshot {
        MetricsSnapshot {
            accepted: 0,
            closed: 0,
            accept_errors: 0,
            pool_exhausted: 0,
            bytes_received: 0,
            bytes_sent: 0,
            active: 0,
            max_active: 0,
        }
    }
    pub fn spawn_reporter() {}
}

pub use imp::*;
