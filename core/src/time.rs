use std::sync::atomic::{AtomicI64, Ordering};

use chrono::Utc;

static NOW_MOCK: AtomicI64 = AtomicI64::new(0);

/// The current time, in epoch seconds. Tests may override this with
/// [`set_mock_time`] to assert on backoff/scheduling math without sleeping.
pub fn now_epoch_seconds() -> i64 {
    let mock = NOW_MOCK.load(Ordering::Relaxed);
    if mock != 0 {
        mock
    } else {
        Utc::now().timestamp()
    }
}

#[cfg(test)]
pub fn set_mock_time(epoch_seconds: i64) {
    NOW_MOCK.store(epoch_seconds, Ordering::Relaxed);
}

#[cfg(test)]
pub fn clear_mock_time() {
    NOW_MOCK.store(0, Ordering::Relaxed);
}
