use std::sync::Mutex;
use std::time::Instant;

use log::warn;
use utils::error::{Error, Result};

use crate::conn::ConnHandle;

/// Bytes reserved at the front of every packet's storage for the packed wire
/// header plus the reliable-transport sub-header, so prepend is zero-copy for
/// any combination of header version and RDP sub-header.
pub const HEADER_SCRATCH: usize = 16;

/// The unpacked form of an SNP header: the fields every wire version carries,
/// independent of bit width.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Id {
	pub pri: u8,
	pub flags: u8,
	pub src: u16,
	pub dst: u16,
	pub dport: u8,
	pub sport: u8,
}

pub mod flags {
	pub const CRC32: u8 = 1;
	pub const RDP: u8 = 2;
	pub const HMAC: u8 = 8;
	pub const FRAG: u8 = 16;
}

/// A pooled packet buffer.
///
/// Owns a fixed-size backing allocation handed out by the [`Pool`] at
/// construction time; the pool performs no further allocation once
/// initialized. Dropping a `Packet` returns its storage to the pool, so
/// double-free is prevented structurally rather than detected at runtime (see
/// [`Pool::double_free_count`]).
pub struct Packet {
	idx: usize,
	storage: Box<[u8]>,

	pub id: Id,
	/// Length of the payload currently held (excludes the header scratch area).
	pub length: u16,
	/// Offset within `storage` where the wire frame (packed header + payload)
	/// currently begins. Set by [`setup_rx`](crate::header::setup_rx) /
	/// [`prepend`](crate::header::prepend).
	pub(crate) frame_begin: usize,
	/// Length in bytes of the packed wire frame, once known.
	pub(crate) frame_length: usize,

	/// Valid only while in transport-layer custody.
	pub tx_time: Option<Instant>,
	pub rx_time: Option<Instant>,
	pub conn: Option<ConnHandle>,

	/// Valid only during CFP/EFP reassembly.
	pub rx_count: u16,
	pub remain: u8,
	pub last_used: Instant,
}

impl Packet {
	fn new(idx: usize, storage: Box<[u8]>) -> Self {
		Self {
			idx,
			storage,
			id: Id::default(),
			length: 0,
			frame_begin: HEADER_SCRATCH,
			frame_length: 0,
			tx_time: None,
			rx_time: None,
			conn: None,
			rx_count: 0,
			remain: 0,
			last_used: Instant::now(),
		}
	}

	/// The full backing storage: `HEADER_SCRATCH` bytes of header scratch followed by the payload area.
	pub fn storage(&self) -> &[u8] {
		&self.storage
	}

	pub fn storage_mut(&mut self) -> &mut [u8] {
		&mut self.storage
	}

	/// The payload area only (after the fixed header scratch), truncated to `length`.
	pub fn payload(&self) -> &[u8] {
		&self.storage[HEADER_SCRATCH..][..self.length as usize]
	}

	pub fn payload_mut(&mut self) -> &mut [u8] {
		let len = self.length as usize;
		&mut self.storage[HEADER_SCRATCH..][..len]
	}

	/// The packed wire frame, once [`prepend`](crate::header::prepend) has run.
	pub fn frame(&self) -> &[u8] {
		&self.storage[self.frame_begin..][..self.frame_length]
	}
}

impl Drop for Packet {
	fn drop(&mut self) {
		Pool::global().release(self.idx, std::mem::take(&mut self.storage));
	}
}

struct Inner {
	slots: Vec<Option<Box<[u8]>>>,
	double_free: u32,
}

/// A finite array of packet slots with a free list. Allocated once at
/// [`Pool::init`](Pool::init); `get` fails rather than allocating once
/// exhausted.
pub struct Pool {
	mtu: usize,
	inner: Mutex<Inner>,
}

static POOL: std::sync::OnceLock<Pool> = std::sync::OnceLock::new();

impl Pool {
	/// Build the process-wide pool. Must be called once, from [`crate::init`].
	pub(crate) fn init(slots: usize, mtu: usize) {
		let slot_size = HEADER_SCRATCH + mtu;
		let slots = (0..slots).map(|_| Some(vec![0u8; slot_size].into_boxed_slice())).collect();

		let _ = POOL.set(Pool { mtu, inner: Mutex::new(Inner { slots, double_free: 0 }) });
	}

	pub fn global() -> &'static Pool {
		POOL.get().expect("snp::init was not called")
	}

	/// Configured maximum payload size.
	pub fn data_size(&self) -> usize {
		self.mtu
	}

	/// Number of slots currently free.
	pub fn remaining(&self) -> usize {
		self.inner.lock().unwrap().slots.iter().filter(|s| s.is_some()).count()
	}

	/// A packet was returned twice by a caller holding two handles to the same
	/// slot; unreachable through the safe `Packet` API (ownership prevents
	/// it), kept so interface statistics have somewhere to report it if an
	/// embedder later exposes an unsafe raw-index API.
	pub fn double_free_count(&self) -> u32 {
		self.inner.lock().unwrap().double_free
	}

	/// Hand out a packet able to hold at least `size` bytes of payload.
	pub fn get(&self, size: usize) -> Result<Packet> {
		if size > self.mtu {
			warn!("pool: requested size {size} exceeds mtu {}", self.mtu);
			return Err(Error::InvalidArgument);
		}

		let mut inner = self.inner.lock().unwrap();

		let Some(idx) = inner.slots.iter().position(Option::is_some) else {
			warn!("pool: exhausted ({} slots)", inner.slots.len());
			return Err(Error::OutOfMemory);
		};

		let storage = inner.slots[idx].take().expect("just checked Some");
		Ok(Packet::new(idx, storage))
	}

	/// Duplicate a packet's header scratch, length, and payload into a freshly allocated slot.
	pub fn clone_packet(&self, packet: &Packet) -> Result<Packet> {
		let mut new = self.get(self.mtu)?;
		new.storage.copy_from_slice(&packet.storage);
		new.id = packet.id;
		new.length = packet.length;
		new.frame_begin = packet.frame_begin;
		new.frame_length = packet.frame_length;
		Ok(new)
	}

	fn release(&self, idx: usize, storage: Box<[u8]>) {
		if storage.is_empty() {
			// `std::mem::take` during an already-completed drop (shouldn't happen via the safe API).
			return;
		}

		let mut inner = self.inner.lock().unwrap();

		if inner.slots[idx].is_some() {
			inner.double_free += 1;
			return;
		}

		inner.slots[idx] = Some(storage);
	}

	/// Same as [`release`](Pool::release) but named for the driver/ISR context
	/// that spec.md documents as the only non-task caller of pool free.
	pub fn free_isr(&self, packet: Packet) {
		drop(packet);
	}
}
