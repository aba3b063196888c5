use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use log::{debug, warn};
use utils::error::{Error, Result};

use crate::pool::{flags, Id, Packet};
use crate::rdp::Rdp;

pub const PRIORITIES: usize = 4;

/// An index into the process-wide connection table. Used in place of a raw
/// pointer anywhere a packet or connection needs to refer back to its
/// connection — e.g. the packet's transient `conn` back-pointer — since the
/// slot it names may be reused after the connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnHandle(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Closed,
	SynSent,
	SynRcvd,
	Open,
	CloseWait,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
	Client,
	Server,
}

/// An opaque handle to the listening socket a server-side connection was
/// spawned from; cleared once the connection is handed off to user code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocketHandle(pub(crate) usize);

/// A 4-tuple connection-identity mask: which `Id` fields participate in
/// connection lookup (priority and flags do not).
pub struct ConnMask;

impl ConnMask {
	pub fn matches(a: &Id, b: &Id) -> bool {
		a.src == b.src && a.dst == b.dst && a.sport == b.sport && a.dport == b.dport
	}
}

pub struct Connection {
	pub state: State,
	pub kind: Kind,
	/// Template an inbound packet must match (after masking) to demux to this slot.
	pub idin: Id,
	/// Template applied to every outbound packet sent on this connection.
	pub idout: Id,
	pub rx_queues: [VecDeque<Packet>; PRIORITIES],
	pub socket: Option<SocketHandle>,
	pub opened_at: Instant,
	pub last_active: Instant,
	pub rdp: Option<Rdp>,

	/// Bitmask of who has requested close: bit 0 local user, bit 1 remote peer, bit 2 timeout.
	pub closed_by: u8,
	pub close_time: Option<Instant>,
}

impl Connection {
	fn closed() -> Self {
		Self {
			state: State::Closed,
			kind: Kind::Client,
			idin: Id::default(),
			idout: Id::default(),
			rx_queues: Default::default(),
			socket: None,
			opened_at: Instant::now(),
			last_active: Instant::now(),
			rdp: None,
			closed_by: 0,
			close_time: None,
		}
	}

	fn reset(&mut self) {
		*self = Self::closed();
	}

	/// Public hook for the reliable transport to fully release a slot.
	pub(crate) fn flush_and_reset(&mut self) {
		self.reset();
	}

	/// Push a received payload onto this connection's priority rx queue,
	/// or a sentinel (`None`) marking end-of-connection.
	pub fn enqueue(&mut self, packet: Option<Packet>) {
		let pri = packet.as_ref().map_or(PRIORITIES - 1, |p| (p.id.pri as usize).min(PRIORITIES - 1));
		if let Some(packet) = packet {
			self.rx_queues[pri].push_back(packet);
		}
	}

	fn flush_rx(&mut self) {
		for q in &mut self.rx_queues {
			q.clear();
		}
	}
}

pub struct ConnTable {
	slots: Mutex<Vec<Connection>>,
	rx_ready: Vec<Condvar>,
	tx_ready: Vec<Condvar>,
	last_given: Mutex<usize>,
	last_sport: Mutex<u8>,
}

static TABLE: std::sync::OnceLock<ConnTable> = std::sync::OnceLock::new();

impl ConnTable {
	pub(crate) fn init(size: usize) {
		let slots = (0..size).map(|_| Connection::closed()).collect();
		let rx_ready = (0..size).map(|_| Condvar::new()).collect();
		let tx_ready = (0..size).map(|_| Condvar::new()).collect();

		let _ = TABLE.set(ConnTable {
			slots: Mutex::new(slots),
			rx_ready,
			tx_ready,
			last_given: Mutex::new(0),
			last_sport: Mutex::new(crate::config::get().max_bindable_port),
		});
	}

	pub fn global() -> &'static ConnTable {
		TABLE.get().expect("snp::init was not called")
	}

	fn lock(&self) -> MutexGuard<Vec<Connection>> {
		self.slots.lock().unwrap()
	}

	/// Scan starting at the slot after the one most recently handed out, for
	/// up to one full lap, per §4.6.
	pub fn allocate(&self, kind: Kind) -> Result<ConnHandle> {
		let mut last = self.last_given.lock().unwrap();
		let mut slots = self.lock();
		let n = slots.len();

		for step in 1..=n {
			let idx = (*last + step) % n;

			if slots[idx].state == State::Closed {
				slots[idx].state = State::SynSent;
				slots[idx].kind = kind;
				slots[idx].opened_at = Instant::now();
				slots[idx].last_active = Instant::now();
				*last = idx;
				return Ok(ConnHandle(idx));
			}
		}

		warn!("conn: no more free connections ({n} slots)");
		Err(Error::OutOfMemory)
	}

	/// Allocate the next ephemeral source port for a connection to
	/// `(dst, dport)`, skipping any in use by an open connection with the
	/// same destination 4-tuple. Spins at most one full lap, per spec.md §9
	/// Open Question (b): a free port can be missed if it happens to sit at
	/// the lap's starting position.
	pub fn alloc_ephemeral(&self, dst: u16, dport: u8) -> Result<u8> {
		let max_port = crate::header::max_port();
		let max_bindable = crate::config::get().max_bindable_port;
		let ephemeral_base = max_bindable + 1;

		let mut sport = self.last_sport.lock().unwrap();
		let start = *sport;
		let slots = self.lock();

		loop {
			*sport = if *sport >= max_port { ephemeral_base } else { *sport + 1 };

			if *sport == start {
				warn!("conn: no free ephemeral port");
				return Err(Error::OutOfMemory);
			}

			let in_use = slots
				.iter()
				.any(|c| c.state != State::Closed && c.idout.sport == *sport && c.idout.dst == dst && c.idout.dport == dport);

			if !in_use {
				return Ok(*sport);
			}
		}
	}

	/// Look up an open client-type connection matching the masked 4-tuple of an inbound packet.
	pub fn find(&self, id: &Id) -> Option<ConnHandle> {
		let slots = self.lock();

		slots
			.iter()
			.enumerate()
			.find(|(_, c)| c.kind == Kind::Client && c.state != State::Closed && ConnMask::matches(&c.idin, id))
			.map(|(i, _)| ConnHandle(i))
	}

	pub fn with<T>(&self, handle: ConnHandle, f: impl FnOnce(&mut Connection) -> T) -> T {
		let mut slots = self.lock();
		f(&mut slots[handle.0])
	}

	/// Block the caller until the connection's rx queues hold data or it closes, or `timeout` elapses.
	pub fn wait_rx(&self, handle: ConnHandle, timeout: Duration) -> Result<bool> {
		let slots = self.lock();

		let (slots, res) = self
			.rx_ready
			.get(handle.0)
			.expect("valid handle")
			.wait_timeout_while(slots, timeout, |s| s[handle.0].state != State::Closed && s[handle.0].rx_queues.iter().all(VecDeque::is_empty))
			.unwrap();

		drop(slots);
		Ok(!res.timed_out())
	}

	pub fn notify_rx(&self, handle: ConnHandle) {
		self.rx_ready[handle.0].notify_all();
	}

	pub fn wait_tx(&self, handle: ConnHandle, timeout: Duration, mut cond: impl FnMut(&Connection) -> bool) -> bool {
		let slots = self.lock();
		let (_slots, res) = self.tx_ready[handle.0].wait_timeout_while(slots, timeout, |s| cond(&s[handle.0])).unwrap();
		!res.timed_out()
	}

	pub fn notify_tx(&self, handle: ConnHandle) {
		self.tx_ready[handle.0].notify_all();
	}

	/// Close the connection: flush rx queues, clear the socket back-pointer,
	/// and — if reliable — delegate the final transition to the transport.
	pub fn close(&self, handle: ConnHandle) -> Result {
		let reliable = self.with(handle, |c| c.idout.flags & flags::RDP != 0 && c.state != State::Closed);

		if !reliable {
			self.with(handle, |c| {
				c.flush_rx();
				c.socket = None;
				c.reset();
			});
			return Ok(());
		}

		match crate::rdp::close(handle, crate::rdp::CloseBy::User) {
			Ok(()) => Ok(()),
			Err(Error::Busy) => {
				debug!("conn {}: close deferred (waiting for peer)", handle.0);
				Ok(())
			}
			Err(e) => Err(e),
		}
	}

	/// Forcibly return a slot to `Closed`, used by the transport once a
	/// graceful close or reset handshake has fully completed.
	pub fn finish_close(&self, handle: ConnHandle) {
		self.with(handle, |c| {
			c.flush_rx();
			c.socket = None;
			c.reset();
		});
		self.notify_tx(handle);
		self.notify_rx(handle);
	}
}
