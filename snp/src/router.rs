//! Router: demultiplexes incoming packets to connections/sockets/callbacks,
//! forwards packets not addressed locally, and drives periodic transport
//! housekeeping. Runs on one dedicated thread, per `csp_qfifo.c`.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, OnceLock};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::conn::{ConnHandle, ConnTable, Kind, State};
use crate::pool::{flags, Id, Packet};

/// Matches `csp_qfifo.h`: short enough that the retransmission scan in
/// [`crate::rdp::scan_timeouts`] runs promptly, since this crate always
/// compiles the reliable transport in.
const FIFO_TIMEOUT: Duration = Duration::from_millis(100);

struct Fifo {
	queues: Mutex<[VecDeque<Packet>; crate::conn::PRIORITIES]>,
	ready: Condvar,
}

static FIFO: OnceLock<Fifo> = OnceLock::new();
static THREAD: OnceLock<Mutex<Option<JoinHandle<()>>>> = OnceLock::new();
static RUNNING: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

pub(crate) fn init() {
	let _ = FIFO.set(Fifo { queues: Mutex::new(Default::default()), ready: Condvar::new() });
	let _ = THREAD.set(Mutex::new(None));
}

/// Hand a freshly received raw packet (already carrying the wire header, not
/// yet stripped) to the router's input queue. Called by interface drivers and
/// by the CFP/EFP reassembly layers once a frame/segment set completes.
pub fn push_rx(packet: Packet) {
	let fifo = FIFO.get().expect("snp::init was not called");
	let pri = (packet.id.pri as usize).min(crate::conn::PRIORITIES - 1);
	let mut queues = fifo.queues.lock().unwrap();
	queues[pri].push_back(packet);
	fifo.ready.notify_all();
}

fn pop_rx(timeout: Duration) -> Option<Packet> {
	let fifo = FIFO.get().expect("snp::init was not called");
	let queues = fifo.queues.lock().unwrap();

	let (mut queues, _) = fifo.ready.wait_timeout_while(queues, timeout, |q| q.iter().all(VecDeque::is_empty)).unwrap();

	for q in queues.iter_mut() {
		if let Some(p) = q.pop_front() {
			return Some(p);
		}
	}
	None
}

/// Start the router thread. Must be called once, from [`crate::init`].
pub(crate) fn start() {
	RUNNING.store(true, std::sync::atomic::Ordering::SeqCst);
	let handle = std::thread::Builder::new().name("snp-router".into()).spawn(run_loop).expect("failed to spawn router thread");
	*THREAD.get().expect("snp::init was not called").lock().unwrap() = Some(handle);
}

pub(crate) fn stop() {
	RUNNING.store(false, std::sync::atomic::Ordering::SeqCst);
	let fifo = FIFO.get().expect("snp::init was not called");
	fifo.ready.notify_all();
	if let Some(handle) = THREAD.get().expect("snp::init was not called").lock().unwrap().take() {
		let _ = handle.join();
	}
}

fn run_loop() {
	while RUNNING.load(std::sync::atomic::Ordering::SeqCst) {
		crate::rdp::scan_timeouts(crate::config::get().conn_table_size);
		crate::cfp::sweep();
		crate::efp::sweep();

		if let Some(packet) = pop_rx(FIFO_TIMEOUT) {
			step(packet);
		}
	}
}

fn step(mut packet: Packet) {
	if crate::header::strip(&mut packet).is_err() {
		trace!("router: malformed header, dropping");
		return;
	}

	let cfg = crate::config::get();
	let local = packet.id.dst == cfg.address;
	let broadcast = crate::header::is_broadcast(packet.id.dst, cfg.netmask);

	if !local && !broadcast {
		forward(packet);
		return;
	}

	deliver(packet);
}

fn forward(packet: Packet) {
	let Some(route) = crate::route::lookup(packet.id.dst) else {
		debug!("router: no route to {}", packet.id.dst);
		return;
	};

	// Split-horizon: never forward back out the ingress interface, unless it opted out.
	if route.iface.split_horizon {
		route.iface.counters.drop.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		return;
	}

	send_via(packet, &route);
}

fn deliver(mut packet: Packet) {
	let table = ConnTable::global();

	if let Some(handle) = table.find(&packet.id) {
		if !security_check(&packet, handle) {
			warn!("router: security check failed on conn {}", handle.0);
			return;
		}

		let reliable = table.with(handle, |c| c.idin.flags & flags::RDP != 0);
		if reliable {
			crate::rdp::accept(handle, packet);
		} else {
			table.with(handle, |c| c.enqueue(Some(packet)));
			table.notify_rx(handle);
		}
		return;
	}

	let port = packet.id.dport;

	match crate::port::lookup(port) {
		Some(crate::port::Binding::Callback) => {
			let _ = crate::port::run_callback(port, packet);
		}
		Some(crate::port::Binding::Socket) => {
			let Ok(handle) = spawn_conn(&mut packet, Kind::Server) else { return };

			let reliable = packet.id.flags & flags::RDP != 0;
			table.with(handle, |c| {
				if reliable {
					c.state = State::SynRcvd;
				} else {
					c.state = State::Open;
				}
			});

			if reliable {
				crate::rdp::accept(handle, packet);
			} else {
				table.with(handle, |c| c.enqueue(Some(packet)));
			}

			crate::port::push_accept(port, handle);
		}
		None => {
			trace!("router: no binding for port {port}, dropping");
		}
	}
}

fn spawn_conn(packet: &mut Packet, kind: Kind) -> utils::error::Result<ConnHandle> {
	let table = ConnTable::global();
	let handle = table.allocate(kind)?;

	let idin = Id { src: packet.id.src, dst: packet.id.dst, sport: packet.id.sport, dport: packet.id.dport, pri: 0, flags: packet.id.flags };
	let idout = Id { src: packet.id.dst, dst: packet.id.src, sport: packet.id.dport, dport: packet.id.sport, pri: packet.id.pri, flags: packet.id.flags };

	table.with(handle, |c| {
		c.idin = idin;
		c.idout = idout;
	});

	Ok(handle)
}

/// HMAC/CRC32 validation per the connection's negotiated flags. CRC32 is
/// checked here (a 4-byte trailer appended after the payload by the sender,
/// when the flag is set); HMAC/XTEA are out of scope for this host build
/// (see DESIGN.md) and always pass.
fn security_check(packet: &Packet, handle: ConnHandle) -> bool {
	let table = ConnTable::global();
	let flags = table.with(handle, |c| c.idin.flags);

	if flags & crate::pool::flags::CRC32 == 0 {
		return true;
	}

	let data = packet.payload();
	if data.len() < 4 {
		return false;
	}

	let (body, trailer) = data.split_at(data.len() - 4);
	let want = u32::from_be_bytes(trailer.try_into().unwrap());
	crc32(body) == want
}

fn crc32(data: &[u8]) -> u32 {
	let mut crc = 0xFFFF_FFFFu32;
	for &byte in data {
		crc ^= byte as u32;
		for _ in 0..8 {
			crc = if crc & 1 != 0 { (crc >> 1) ^ 0xEDB8_8320 } else { crc >> 1 };
		}
	}
	!crc
}

/// Send a fully-formed (header not yet prepended) packet: resolves a route,
/// prepends the wire header, and transmits. Used by user-facing send paths,
/// the reliable transport, and the service handler.
pub fn send_packet(packet: Packet) {
	let cfg = crate::config::get();

	if packet.id.dst == cfg.address {
		// Loopback: the packet is already in unpacked form, so skip the wire round-trip entirely.
		deliver(packet);
		return;
	}

	let Some(route) = crate::route::lookup(packet.id.dst) else {
		debug!("router: no route to {}, dropping outbound packet", packet.id.dst);
		return;
	};

	send_via(packet, &route);
}

fn send_via(mut packet: Packet, route: &crate::route::Route) {
	crate::header::prepend(&mut packet);
	let via = if route.via == crate::route::NO_VIA { None } else { Some(route.via) };

	if let Err(e) = route.iface.transmit(&packet, via) {
		warn!("router: transmit on {} failed: {e}", route.iface.name);
	}
}
