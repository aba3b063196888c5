use std::time::{Instant, SystemTime};

/// Epoch used to report uptime and timestamp fields; set once by [`init`].
static START: std::sync::OnceLock<(Instant, SystemTime)> = std::sync::OnceLock::new();

/// Record the process start time. Idempotent; later calls are ignored.
pub fn init() {
	let _ = START.set((Instant::now(), SystemTime::now()));
}

fn start() -> (Instant, SystemTime) {
	*START.get_or_init(|| (Instant::now(), SystemTime::now()))
}

/// Get the current system time, derived from the monotonic clock so it stays
/// well-ordered even if the wall clock is adjusted mid-run.
pub fn system() -> SystemTime {
	let (mono, wall) = start();
	wall + mono.elapsed()
}

/// Get the UNIX time in seconds.
pub fn unix() -> u32 {
	system()
		.duration_since(SystemTime::UNIX_EPOCH)
		.expect("the current time should be after the UNIX epoch")
		.as_secs()
		.try_into()
		.expect("32-bit UNIX time should not overflow")
}

/// Seconds elapsed since [`init`] was called.
pub fn uptime() -> u32 {
	start().0.elapsed().as_secs().try_into().expect("32-bit uptime should not overflow")
}
