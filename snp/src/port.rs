//! Port / socket registry: a fixed table sized `max_port() + 2`, the last
//! slot reserved for the wildcard ("any port") binding.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, OnceLock};

use utils::error::{Error, Result};

use crate::conn::ConnHandle;
use crate::pool::Packet;

/// A synchronous in-router callback, invoked on the router thread with the
/// inbound packet (still owning its storage). Must not block.
pub trait Callback: Send + Sync {
	fn call(&self, packet: Packet);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Slot {
	Closed,
	Socket,
	Callback,
}

struct Entry {
	slot: Slot,
	accept_queue: VecDeque<ConnHandle>,
	callback: Option<Arc<dyn Callback>>,
}

impl Entry {
	fn closed() -> Self {
		Self { slot: Slot::Closed, accept_queue: VecDeque::new(), callback: None }
	}
}

struct Table {
	entries: Mutex<Vec<Entry>>,
	accept_ready: Condvar,
}

static TABLE: OnceLock<Table> = OnceLock::new();

pub(crate) fn init(max_port: u8) {
	let size = max_port as usize + 2;
	let entries = (0..size).map(|_| Entry::closed()).collect();
	let _ = TABLE.set(Table { entries: Mutex::new(entries), accept_ready: Condvar::new() });
}

fn table() -> &'static Table {
	TABLE.get().expect("snp::init was not called")
}

/// Index of the wildcard slot (`CSP_ANY`), one past the last real port.
pub fn wildcard() -> u8 {
	crate::header::max_port()
}

fn slot_index(port: u8) -> usize {
	if port == wildcard() {
		crate::header::max_port() as usize + 1
	} else {
		port as usize
	}
}

/// Bind a listening socket to `port`. Fails with `Error::Already` if the slot is not closed.
pub fn bind(port: u8) -> Result {
	let mut entries = table().entries.lock().unwrap();
	let idx = slot_index(port);

	if entries[idx].slot != Slot::Closed {
		return Err(Error::Already);
	}

	entries[idx] = Entry { slot: Slot::Socket, ..Entry::closed() };
	Ok(())
}

/// Bind a synchronous callback to `port`.
pub fn bind_callback(port: u8, callback: Box<dyn Callback>) -> Result {
	let mut entries = table().entries.lock().unwrap();
	let idx = slot_index(port);

	if entries[idx].slot != Slot::Closed {
		return Err(Error::Already);
	}

	entries[idx] = Entry { slot: Slot::Callback, callback: Some(Arc::from(callback)), ..Entry::closed() };
	Ok(())
}

pub fn unbind(port: u8) {
	let mut entries = table().entries.lock().unwrap();
	entries[slot_index(port)] = Entry::closed();
}

pub enum Binding {
	Socket,
	Callback,
}

/// Look up the binding for `port`, falling back to the wildcard slot when the
/// specific port is closed.
pub fn lookup(port: u8) -> Option<Binding> {
	let entries = table().entries.lock().unwrap();
	let idx = slot_index(port);

	let chosen = if entries[idx].slot != Slot::Closed { idx } else { slot_index(wildcard()) };

	match entries[chosen].slot {
		Slot::Closed => None,
		Slot::Socket => Some(Binding::Socket),
		Slot::Callback => Some(Binding::Callback),
	}
}

/// Run the callback bound to `port` (or its wildcard fallback), if any.
/// Returns the packet back on failure to find a bound callback, so the caller
/// can fall back to other demux paths.
///
/// The callback handle is cloned out and the table lock released before it
/// runs: a callback's own reply (e.g. the service handler's) may route back
/// through this same port table on the same thread (a loopback reply, or
/// any other re-entrant delivery), and holding the lock across `cb.call`
/// would deadlock against that re-entry.
pub fn run_callback(port: u8, packet: Packet) -> Result<(), Packet> {
	let cb = {
		let entries = table().entries.lock().unwrap();
		let idx = slot_index(port);
		let chosen = if entries[idx].slot == Slot::Callback {
			Some(idx)
		} else if entries[slot_index(wildcard())].slot == Slot::Callback {
			Some(slot_index(wildcard()))
		} else {
			None
		};

		chosen.and_then(|i| entries[i].callback.clone())
	};

	match cb {
		Some(cb) => {
			cb.call(packet);
			Ok(())
		}
		None => Err(packet),
	}
}

/// Push a newly accepted connection onto `port`'s accept queue.
pub fn push_accept(port: u8, conn: ConnHandle) {
	let t = table();
	let mut entries = t.entries.lock().unwrap();
	let idx = slot_index(port);
	entries[idx].accept_queue.push_back(conn);
	t.accept_ready.notify_all();
}

/// Block until a connection is waiting in `port`'s accept queue, or `timeout` elapses.
pub fn accept(port: u8, timeout: std::time::Duration) -> Option<ConnHandle> {
	let t = table();
	let entries = t.entries.lock().unwrap();
	let idx = slot_index(port);

	let (mut entries, _) = t.accept_ready.wait_timeout_while(entries, timeout, |e| e[idx].accept_queue.is_empty()).unwrap();
	entries[idx].accept_queue.pop_front()
}
