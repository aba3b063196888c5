//! Built-in service handler: the CMP dispatch on port 0 plus ping/ps/memfree/
//! reboot/buffer-free/uptime on ports 1-6, per `csp_service_handler.c` and
//! `csp_cmp.h`.

use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use log::trace;

use crate::config::ports;
use crate::pool::{Id, Packet};

mod cmp {
	pub const REQUEST: u8 = 0x00;
	pub const REPLY: u8 = 0xFF;

	pub const IDENT: u8 = 1;
	pub const ROUTE_SET_V1: u8 = 2;
	pub const IF_STATS: u8 = 3;
	pub const PEEK: u8 = 4;
	pub const POKE: u8 = 5;
	pub const CLOCK: u8 = 6;
	pub const ROUTE_SET_V2: u8 = 7;
}

const REBOOT_MAGIC: u32 = 0x8007_8007;
const SHUTDOWN_MAGIC: u32 = 0xD1E5_529A;
const PEEK_POKE_MAX: usize = 200;
const ARENA_SIZE: usize = 4096;

/// A bounded byte arena standing in for the real memory-mapped address space
/// `peek`/`poke` operate on in firmware; there is no such space on a host binary.
static ARENA: OnceLock<Mutex<Vec<u8>>> = OnceLock::new();

/// Platform hooks for the handful of service operations that need one: the
/// wall clock and a process-listing string. The host binary may wire these to
/// real platform calls, or leave the defaults.
pub trait Platform: Send + Sync {
	fn clock_get(&self) -> (u32, u32) {
		let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
		(now.as_secs() as u32, now.subsec_nanos())
	}
	fn clock_set(&self, _sec: u32, _nsec: u32) {}
	fn ps(&self) -> &'static str {
		"snp-router\nsnp-user\n"
	}
}

struct DefaultPlatform;
impl Platform for DefaultPlatform {}

static PLATFORM: OnceLock<Box<dyn Platform>> = OnceLock::new();

pub(crate) fn init() {
	let _ = ARENA.set(Mutex::new(vec![0u8; ARENA_SIZE]));
	let _ = PLATFORM.set(Box::new(DefaultPlatform));
}

/// Install a custom platform hook. Must be called before [`crate::init`]
/// completes binds for the service ports; later calls are ignored.
pub fn set_platform(platform: Box<dyn Platform>) {
	let _ = PLATFORM.set(platform);
}

fn platform() -> &'static dyn Platform {
	PLATFORM.get().expect("snp::init was not called").as_ref()
}

fn reply_to(id: &Id) -> Id {
	Id { src: id.dst, dst: id.src, sport: id.dport, dport: id.sport, pri: id.pri, flags: id.flags }
}

fn send_reply(id: &Id, data: &[u8]) {
	let Ok(mut packet) = crate::pool::Pool::global().get(data.len()) else { return };
	packet.id = *id;
	packet.length = data.len() as u16;
	packet.payload_mut().copy_from_slice(data);
	crate::router::send_packet(packet);
}

/// Dispatch an inbound packet already known to target one of the reserved
/// service ports (0-6). Invoked from the router in place of ordinary socket
/// delivery, or from a user-level handler for the same purpose.
pub fn handle(packet: &Packet) {
	match packet.id.dport {
		ports::CMP => handle_cmp(packet),
		ports::PING => send_reply(&reply_to(&packet.id), packet.payload()),
		ports::PS => send_reply(&reply_to(&packet.id), platform().ps().as_bytes()),
		ports::MEMFREE | ports::BUF_FREE => {
			let free = crate::pool::Pool::global().remaining() as u32;
			send_reply(&reply_to(&packet.id), &free.to_be_bytes());
		}
		ports::REBOOT => handle_reboot(packet),
		ports::UPTIME => send_reply(&reply_to(&packet.id), &runtime::time::uptime().to_be_bytes()),
		_ => trace!("service: unhandled port {}", packet.id.dport),
	}
}

fn handle_reboot(packet: &Packet) {
	if packet.payload().len() < 4 {
		return;
	}
	let magic = u32::from_be_bytes(packet.payload()[..4].try_into().unwrap());
	match magic {
		REBOOT_MAGIC => trace!("service: reboot requested"),
		SHUTDOWN_MAGIC => trace!("service: shutdown requested"),
		_ => {}
	}
}

fn handle_cmp(packet: &Packet) {
	let body = packet.payload();
	if body.len() < 2 || body[0] != cmp::REQUEST {
		return;
	}
	let code = body[1];
	let payload = &body[2..];

	match code {
		cmp::IDENT => reply_ident(packet),
		cmp::ROUTE_SET_V1 => route_set_v1(payload),
		cmp::ROUTE_SET_V2 => route_set_v2(payload),
		cmp::IF_STATS => reply_if_stats(packet, payload),
		cmp::PEEK => reply_peek(packet, payload),
		cmp::POKE => do_poke(payload),
		cmp::CLOCK => handle_clock(packet, payload),
		_ => trace!("service: unknown CMP code {code}"),
	}
}

fn cmp_reply(id: &Id, code: u8, body: &[u8]) {
	let mut out = vec![cmp::REPLY, code];
	out.extend_from_slice(body);
	send_reply(&reply_to(id), &out);
}

fn pad(s: &str, len: usize) -> Vec<u8> {
	let mut v = s.as_bytes().to_vec();
	v.resize(len, 0);
	v
}

fn reply_ident(packet: &Packet) {
	let cfg = crate::config::get();
	let mut out = Vec::with_capacity(20 + 30 + 20 + 12 + 9);
	out.extend(pad(cfg.hostname, 20));
	out.extend(pad(cfg.model, 30));
	out.extend(pad(cfg.revision, 20));
	out.extend(pad(env!("CARGO_PKG_VERSION"), 12));
	out.extend(pad("00:00:00", 9));
	cmp_reply(&packet.id, cmp::IDENT, &out);
}

fn route_set_v1(payload: &[u8]) {
	if payload.len() < 2 + 11 {
		return;
	}
	let dst = payload[0] as u16;
	let via = payload[1] as u16;
	let name = String::from_utf8_lossy(&payload[2..13]).trim_end_matches('\0').to_string();
	if let Some(iface) = crate::iface::find(&name) {
		crate::route::set(dst, crate::header::host_bits() as u8, iface, via);
	}
}

fn route_set_v2(payload: &[u8]) {
	if payload.len() < 5 + 11 {
		return;
	}
	let dst = u16::from_be_bytes([payload[0], payload[1]]);
	let via = u16::from_be_bytes([payload[2], payload[3]]);
	let netmask = payload[4];
	let name = String::from_utf8_lossy(&payload[5..16]).trim_end_matches('\0').to_string();
	if let Some(iface) = crate::iface::find(&name) {
		crate::route::set(dst, netmask, iface, via);
	}
}

fn reply_if_stats(packet: &Packet, payload: &[u8]) {
	let name = String::from_utf8_lossy(payload.get(..11).unwrap_or(payload)).trim_end_matches('\0').to_string();
	let Some(iface) = crate::iface::find(&name) else { return };

	let mut out = Vec::with_capacity(9 * 4);
	for v in iface.counters.snapshot() {
		out.extend_from_slice(&v.to_be_bytes());
	}
	cmp_reply(&packet.id, cmp::IF_STATS, &out);
}

fn reply_peek(packet: &Packet, payload: &[u8]) {
	if payload.len() < 5 {
		return;
	}
	let addr = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
	let len = (payload[4] as usize).min(PEEK_POKE_MAX);

	let arena = ARENA.get().expect("snp::init was not called").lock().unwrap();
	if addr + len > arena.len() {
		return;
	}

	cmp_reply(&packet.id, cmp::PEEK, &arena[addr..addr + len]);
}

fn do_poke(payload: &[u8]) {
	if payload.len() < 5 {
		return;
	}
	let addr = u32::from_be_bytes(payload[0..4].try_into().unwrap()) as usize;
	let len = (payload[4] as usize).min(PEEK_POKE_MAX).min(payload.len() - 5);

	let mut arena = ARENA.get().expect("snp::init was not called").lock().unwrap();
	if addr + len > arena.len() {
		return;
	}
	arena[addr..addr + len].copy_from_slice(&payload[5..5 + len]);
}

fn handle_clock(packet: &Packet, payload: &[u8]) {
	if payload.len() >= 8 {
		let sec = u32::from_be_bytes(payload[0..4].try_into().unwrap());
		let nsec = u32::from_be_bytes(payload[4..8].try_into().unwrap());
		platform().clock_set(sec, nsec);
	}

	let (sec, nsec) = platform().clock_get();
	let mut out = Vec::with_capacity(8);
	out.extend_from_slice(&sec.to_be_bytes());
	out.extend_from_slice(&nsec.to_be_bytes());
	cmp_reply(&packet.id, cmp::CLOCK, &out);
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use crate::{config, opt, Socket};

	/// A ping sent to a local address is answered synchronously, on the
	/// sender's own thread, via the loopback branch of `router::send_packet`.
	/// This exercises the same call chain a self-addressed reply to any
	/// service port takes: `send_packet` -> `deliver` -> `port::run_callback`
	/// -> `service::handle` -> `send_reply` -> `send_packet` again.
	#[test]
	fn ping_over_loopback() {
		crate::test_support::init();
		let cfg = config::get();

		let client = Socket::connect(cfg.address, config::ports::PING, 0, opt::NONE, Duration::from_millis(100)).unwrap();
		client.send(b"ping").unwrap();

		let data = client.recv(Duration::from_secs(1)).unwrap();
		assert_eq!(data.as_deref(), Some(&b"ping"[..]));
	}
}
