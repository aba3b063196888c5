//! Interface list: an append-only registry of link-layer endpoints.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

/// Per-interface traffic and error counters, each updated independently by
/// the router, transport, and fragmentation layers.
#[derive(Default)]
pub struct Counters {
	pub tx: AtomicU32,
	pub rx: AtomicU32,
	pub tx_error: AtomicU32,
	pub rx_error: AtomicU32,
	pub drop: AtomicU32,
	pub autherr: AtomicU32,
	pub frame: AtomicU32,
	pub txbytes: AtomicU32,
	pub rxbytes: AtomicU32,
}

impl Counters {
	pub fn snapshot(&self) -> [u32; 9] {
		[
			self.tx.load(Ordering::Relaxed),
			self.rx.load(Ordering::Relaxed),
			self.tx_error.load(Ordering::Relaxed),
			self.rx_error.load(Ordering::Relaxed),
			self.drop.load(Ordering::Relaxed),
			self.autherr.load(Ordering::Relaxed),
			self.frame.load(Ordering::Relaxed),
			self.txbytes.load(Ordering::Relaxed),
			self.rxbytes.load(Ordering::Relaxed),
		]
	}
}

/// A transmit hook a driver registers for this interface. Invoked from the
/// router thread or directly by user code; must not block.
pub trait Transmit: Send + Sync {
	fn transmit(&self, packet: &crate::pool::Packet, via: Option<u16>) -> utils::error::Result;
}

pub struct Interface {
	pub name: String,
	pub mtu: usize,
	/// When set, the router never forwards a packet back out the interface it arrived on.
	pub split_horizon: bool,
	pub counters: Counters,
	driver: Box<dyn Transmit>,
}

impl Interface {
	pub fn transmit(&self, packet: &crate::pool::Packet, via: Option<u16>) -> utils::error::Result {
		match self.driver.transmit(packet, via) {
			Ok(()) => {
				self.counters.tx.fetch_add(1, Ordering::Relaxed);
				self.counters.txbytes.fetch_add(packet.length as u32, Ordering::Relaxed);
				Ok(())
			}
			Err(e) => {
				self.counters.tx_error.fetch_add(1, Ordering::Relaxed);
				Err(e)
			}
		}
	}
}

pub struct Loopback;

impl Transmit for Loopback {
	fn transmit(&self, _packet: &crate::pool::Packet, _via: Option<u16>) -> utils::error::Result {
		Ok(())
	}
}

struct Registry {
	list: Mutex<Vec<Arc<Interface>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// The name every installed loopback interface carries.
pub const LOOPBACK_NAME: &str = "lo";

pub(crate) fn init() {
	let _ = REGISTRY.set(Registry { list: Mutex::new(Vec::new()) });
	register(LOOPBACK_NAME, usize::MAX, false, Box::new(Loopback));
}

fn registry() -> &'static Registry {
	REGISTRY.get().expect("snp::init was not called")
}

/// Append a new interface. Interfaces are never removed once registered.
pub fn register(name: &str, mtu: usize, split_horizon: bool, driver: Box<dyn Transmit>) -> Arc<Interface> {
	let iface = Arc::new(Interface { name: name.to_string(), mtu, split_horizon, counters: Counters::default(), driver });
	registry().list.lock().unwrap().push(iface.clone());
	iface
}

/// Case-insensitive lookup by name.
pub fn find(name: &str) -> Option<Arc<Interface>> {
	registry().list.lock().unwrap().iter().find(|i| i.name.eq_ignore_ascii_case(name)).cloned()
}

pub fn list() -> Vec<Arc<Interface>> {
	registry().list.lock().unwrap().clone()
}
