// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// How often overflow warnings may repeat for one buffer.
pub(crate) const DROP_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Lets a noisy warning through at most once per interval, from any thread.
#[derive(Debug)]
pub(crate) struct LogThrottle {
    origin: Instant,
    interval_ms: u64,
    next_allowed_ms: AtomicU64,
}

impl LogThrottle {
    pub(crate) fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval_ms: u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
            next_allowed_ms: AtomicU64::new(0),
        }
    }

    pub(crate) fn should_log(&self) -> bool {
        let now = u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX);
        let next = self.next_allowed_ms.load(Ordering::Relaxed);
        if now < next {
            return false;
        }
        self.next_allowed_ms
            .compare_exchange(
                next,
                now.saturating_add(self.interval_ms),
                Ordering::Relaxed,
                Ordering::Relaxed,
            )
            .is_ok()
    }
}

/// Wall clock in milliseconds since the unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
