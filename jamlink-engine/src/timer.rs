//! The 1 ms wall-clock tick.
//!
//! One thread at the highest available scheduler priority advances an
//! absolute deadline by 1 ms per tick, nudged by plus or minus one
//! microsecond under closed-loop control from the ring-buffer water
//! classes. An idle server sleeps a full second between probes to save
//! CPU; the deadline is re-anchored afterwards so the loop never tries
//! to catch up on sleep.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::runtime::Runtime;

/// Tick periods in nanoseconds, selected by the steering word.
const PERIOD_FAST: u64 = 999_000;
const PERIOD_NOMINAL: u64 = 1_000_000;
const PERIOD_SLOW: u64 = 1_001_000;

/// Ticks an idle server keeps running before sleeping.
const IDLE_GRACE_TICKS: u16 = 1000;

pub fn spawn(rt: Arc<Runtime>) -> std::io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("jamlink-timer".to_string())
        .spawn(move || timer_loop(rt))
}

fn timer_loop(rt: Arc<Runtime>) {
    set_max_priority();

    let mut next = Instant::now();
    let mut grace: u16 = 0;

    loop {
        let adjust = rt.timer_adjust.load(Ordering::Relaxed);
        let period = if adjust < 0 {
            PERIOD_FAST
        } else if adjust > 0 {
            PERIOD_SLOW
        } else {
            PERIOD_NOMINAL
        };
        next += Duration::from_nanos(period);

        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }

        let active = rt.run_tick();

        if rt.client().is_none() {
            if active {
                grace = IDLE_GRACE_TICKS;
            } else if grace == 0 {
                thread::sleep(Duration::from_secs(1));
                next = Instant::now();
            } else {
                grace -= 1;
            }
        }
    }
}

/// Raise this thread to the maximum priority of its current scheduling
/// policy. Best effort: failure leaves the default priority.
#[cfg(unix)]
fn set_max_priority() {
    unsafe {
        let thread = libc::pthread_self();
        let mut policy: libc::c_int = 0;
        let mut param: libc::sched_param = std::mem::zeroed();

        if libc::pthread_getschedparam(thread, &mut policy, &mut param) == 0 {
            param.sched_priority = libc::sched_get_priority_max(policy);
            let _ = libc::pthread_setschedparam(thread, policy, &param);
        }
    }
}

#[cfg(not(unix))]
fn set_max_priority() {}
