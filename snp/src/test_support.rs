//! Test-only process init, shared by every module's `#[cfg(test)]` tests.
//! Config and the pool are process-wide singletons, so init must run exactly
//! once per test binary regardless of how many test modules call it.

use std::sync::Once;

static INIT: Once = Once::new();

pub fn init() {
	INIT.call_once(|| {
		crate::init(crate::config::Config::default()).expect("test init failed");
	});
}
