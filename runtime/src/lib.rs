pub mod logger;
pub mod time;

use log::LevelFilter;

use self::logger::Logger;

static LOGGER: Logger = Logger;

/// Install the process-wide logger and start the uptime/wall-clock epoch.
///
/// Idempotent: a second call only adjusts the max level.
pub fn init(level: LevelFilter) {
	time::init();
	let _ = log::set_logger(&LOGGER);
	log::set_max_level(level);
}
