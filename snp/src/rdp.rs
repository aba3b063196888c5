//! Reliable transport: a connection-oriented, sliding-window, selective-ack
//! protocol carried as a 5-byte control header immediately after the SNP
//! header, modeled on `csp_rdp.c`.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use rand::random;
use utils::error::{Error, Result};

use crate::conn::{ConnHandle, ConnTable, State};
use crate::pool::{Id, Packet};

pub const HEADER_LEN: usize = 5;

/// Stands in for spec.md's "infinite" timeout sentinel; `Duration::MAX` itself
/// overflows `Condvar::wait_timeout`'s internal deadline arithmetic on some
/// platforms, so a long-but-finite value is used instead (§5).
const NO_TIMEOUT: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 100);

mod ctl {
	pub const SYN: u8 = 0x01;
	pub const ACK: u8 = 0x02;
	pub const EAK: u8 = 0x04;
	pub const RST: u8 = 0x08;
}

/// Parsed form of the 5-byte control header: `flags:u8, seq:u16be, ack:u16be`.
#[derive(Debug, Clone, Copy)]
struct Control {
	flags: u8,
	seq: u16,
	ack: u16,
}

impl Control {
	fn syn(&self) -> bool {
		self.flags & ctl::SYN != 0
	}
	fn ack_set(&self) -> bool {
		self.flags & ctl::ACK != 0
	}
	fn eack(&self) -> bool {
		self.flags & ctl::EAK != 0
	}
	fn rst(&self) -> bool {
		self.flags & ctl::RST != 0
	}

	fn parse(bytes: &[u8]) -> Option<Self> {
		if bytes.len() < HEADER_LEN {
			return None;
		}
		Some(Self { flags: bytes[0], seq: u16::from_be_bytes([bytes[1], bytes[2]]), ack: u16::from_be_bytes([bytes[3], bytes[4]]) })
	}

	fn write(&self, out: &mut [u8]) {
		out[0] = self.flags;
		out[1..3].copy_from_slice(&self.seq.to_be_bytes());
		out[3..5].copy_from_slice(&self.ack.to_be_bytes());
	}
}

/// 16-bit modular sequence comparison: is `a` strictly before `b`?
fn before(a: u16, b: u16) -> bool {
	((a as i16).wrapping_sub(b as i16)) < 0
}

/// Is `x` within the closed interval `[lo, hi]` (modular)?
fn between(x: u16, lo: u16, hi: u16) -> bool {
	hi.wrapping_sub(lo) >= x.wrapping_sub(lo)
}

struct TxEntry {
	seq: u16,
	packet: Packet,
	sent_at: Instant,
	acked: bool,
}

#[derive(Clone, Copy)]
pub enum CloseBy {
	User,
	Peer,
	Timeout,
}

impl CloseBy {
	fn bit(self) -> u8 {
		match self {
			CloseBy::User => 0b001,
			CloseBy::Peer => 0b010,
			CloseBy::Timeout => 0b100,
		}
	}
}

/// Per-connection reliable-transport state, negotiated at handshake time.
pub struct Rdp {
	snd_iss: u16,
	snd_nxt: u16,
	snd_una: u16,
	rcv_irs: u16,
	rcv_cur: u16,

	window: u16,
	conn_timeout_ms: u32,
	packet_timeout_ms: u32,
	delayed_acks: bool,
	ack_timeout_ms: u32,
	ack_delay_count: u16,

	tx_retry: VecDeque<TxEntry>,
	reorder: Vec<(u16, Packet)>,
	unacked_since_ack: u16,
	last_ack_time: Instant,

	closed_by: u8,
	close_time: Option<Instant>,
	syn_retried: bool,
}

impl Rdp {
	fn with_defaults() -> Self {
		let cfg = crate::config::get();
		Self {
			snd_iss: 0,
			snd_nxt: 0,
			snd_una: 0,
			rcv_irs: 0,
			rcv_cur: 0,
			window: cfg.rdp_window_size,
			conn_timeout_ms: cfg.rdp_conn_timeout_ms,
			packet_timeout_ms: cfg.rdp_packet_timeout_ms,
			delayed_acks: cfg.rdp_delayed_acks,
			ack_timeout_ms: cfg.rdp_ack_timeout_ms,
			ack_delay_count: cfg.rdp_ack_delay_count,
			tx_retry: VecDeque::new(),
			reorder: Vec::new(),
			unacked_since_ack: 0,
			last_ack_time: Instant::now(),
			closed_by: 0,
			close_time: None,
			syn_retried: false,
		}
	}
}

fn negotiation_words(rdp: &Rdp) -> [u32; 6] {
	[rdp.window as u32, rdp.conn_timeout_ms, rdp.packet_timeout_ms, rdp.delayed_acks as u32, rdp.ack_timeout_ms, rdp.ack_delay_count as u32]
}

fn apply_negotiation(rdp: &mut Rdp, words: [u32; 6]) {
	rdp.window = words[0] as u16;
	rdp.conn_timeout_ms = words[1];
	rdp.packet_timeout_ms = words[2];
	rdp.delayed_acks = words[3] != 0;
	rdp.ack_timeout_ms = words[4];
	rdp.ack_delay_count = words[5] as u16;
}

fn read_words(payload: &[u8]) -> [u32; 6] {
	let mut words = [0u32; 6];
	for (i, w) in words.iter_mut().enumerate() {
		let off = i * 4;
		*w = u32::from_be_bytes(payload[off..off + 4].try_into().unwrap());
	}
	words
}

fn write_words(words: [u32; 6], out: &mut [u8]) {
	for (i, w) in words.iter().enumerate() {
		out[i * 4..i * 4 + 4].copy_from_slice(&w.to_be_bytes());
	}
}

/// Build and transmit a bare control packet (no payload beyond the negotiation
/// words, when present) using `idout` as the outbound identity template.
fn send_control(idout: &Id, flags: u8, seq: u16, ack: u16, words: Option<[u32; 6]>) {
	let size = HEADER_LEN + words.map_or(0, |_| 24);
	let Ok(mut packet) = crate::pool::Pool::global().get(size) else {
		warn!("rdp: pool exhausted building control packet");
		return;
	};

	packet.id = *idout;
	packet.length = size as u16;
	Control { flags, seq, ack }.write(&mut packet.payload_mut()[..HEADER_LEN]);
	if let Some(words) = words {
		write_words(words, &mut packet.payload_mut()[HEADER_LEN..]);
	}

	crate::router::send_packet(packet);
}

/// Initiate an outgoing connection: send SYN, block up to `conn_timeout_ms`.
pub fn connect(handle: ConnHandle, idout: Id) -> Result {
	let table = ConnTable::global();

	let mut rdp = Rdp::with_defaults();
	rdp.snd_iss = random();
	rdp.snd_nxt = rdp.snd_iss.wrapping_add(1);
	rdp.snd_una = rdp.snd_nxt;
	let words = negotiation_words(&rdp);
	let timeout_ms = rdp.conn_timeout_ms;

	table.with(handle, |c| c.rdp = Some(rdp));

	send_control(&idout, ctl::SYN, table.with(handle, |c| c.rdp.as_ref().unwrap().snd_iss), 0, Some(words));

	let opened = table.wait_tx(handle, Duration::from_millis(timeout_ms as u64), |c| c.state == State::SynSent);

	table.with(handle, |c| match c.state {
		State::Open => Ok(()),
		_ if !opened => {
			c.reset_to_closed();
			Err(Error::TimedOut)
		}
		_ => Err(Error::TimedOut),
	})
}

impl crate::conn::Connection {
	/// Return this slot fully to the free state, regardless of how it got here.
	fn reset_to_closed(&mut self) {
		self.flush_and_reset();
	}
}

/// Entry point from the router for every inbound packet on a reliable connection.
pub fn accept(handle: ConnHandle, packet: Packet) {
	let Some(ctrl) = Control::parse(packet.payload()) else {
		debug!("rdp: short control header, dropping");
		return;
	};

	let table = ConnTable::global();

	if ctrl.rst() {
		handle_reset(table, handle, ctrl);
		return;
	}

	let state = table.with(handle, |c| c.state);

	match state {
		State::Closed => {
			if ctrl.syn() && !ctrl.ack_set() {
				handle_syn(table, handle, &packet, ctrl);
			} else {
				let idout = table.with(handle, |c| c.idout);
				send_control(&idout, ctl::RST, 0, ctrl.seq.wrapping_add(1), None);
			}
		}
		State::SynSent => handle_synsent(table, handle, ctrl),
		State::SynRcvd => {
			if ctrl.ack_set() {
				table.with(handle, |c| c.state = State::Open);
				table.notify_tx(handle);
			}
		}
		State::Open | State::CloseWait => handle_data(table, handle, &packet, ctrl),
	}
}

fn handle_syn(table: &ConnTable, handle: ConnHandle, packet: &Packet, ctrl: Control) {
	if packet.payload().len() < HEADER_LEN + 24 {
		debug!("rdp: SYN missing negotiation words, dropping");
		return;
	}
	let words = read_words(&packet.payload()[HEADER_LEN..]);

	let mut rdp = Rdp::with_defaults();
	apply_negotiation(&mut rdp, words);
	rdp.rcv_irs = ctrl.seq;
	rdp.rcv_cur = ctrl.seq;
	rdp.snd_iss = random();
	rdp.snd_nxt = rdp.snd_iss.wrapping_add(1);
	rdp.snd_una = rdp.snd_nxt;

	let idout = table.with(handle, |c| {
		c.idin = packet.id;
		c.idout = Id { src: packet.id.dst, dst: packet.id.src, sport: packet.id.dport, dport: packet.id.sport, ..packet.id };
		c.rdp = Some(rdp);
		c.state = State::SynRcvd;
		c.idout
	});

	send_control(&idout, ctl::SYN | ctl::ACK, table.with(handle, |c| c.rdp.as_ref().unwrap().snd_iss), ctrl.seq, None);
}

fn handle_synsent(table: &ConnTable, handle: ConnHandle, ctrl: Control) {
	if ctrl.syn() && ctrl.ack_set() {
		let ok = table.with(handle, |c| c.rdp.as_ref().unwrap().snd_iss == ctrl.ack);
		if !ok {
			return;
		}
		let idout = table.with(handle, |c| {
			let rdp = c.rdp.as_mut().unwrap();
			rdp.rcv_irs = ctrl.seq;
			rdp.rcv_cur = ctrl.seq;
			c.state = State::Open;
			c.idout
		});
		send_control(&idout, ctl::ACK, table.with(handle, |c| c.rdp.as_ref().unwrap().snd_nxt), ctrl.seq, None);
		table.notify_tx(handle);
		table.notify_rx(handle);
		return;
	}

	if ctrl.ack_set() && !ctrl.syn() {
		let retry = table.with(handle, |c| {
			let already = c.rdp.as_ref().unwrap().syn_retried;
			c.rdp.as_mut().unwrap().syn_retried = true;
			!already
		});

		let idout = table.with(handle, |c| c.idout);
		send_control(&idout, ctl::RST, 0, 0, None);

		if retry {
			let words = table.with(handle, |c| negotiation_words(c.rdp.as_ref().unwrap()));
			let iss = table.with(handle, |c| {
				let rdp = c.rdp.as_mut().unwrap();
				rdp.snd_iss = random();
				rdp.snd_nxt = rdp.snd_iss.wrapping_add(1);
				rdp.snd_una = rdp.snd_nxt;
				rdp.snd_iss
			});
			send_control(&idout, ctl::SYN, iss, 0, Some(words));
		} else {
			table.with(handle, |c| c.reset_to_closed());
			table.notify_tx(handle);
		}
	}
}

fn handle_reset(table: &ConnTable, handle: ConnHandle, ctrl: Control) {
	let (state, has_socket) = table.with(handle, |c| (c.state, c.socket.is_some()));
	if state == State::Closed {
		return;
	}

	table.with(handle, |c| {
		for q in &mut c.rx_queues {
			q.clear();
		}
		c.closed_by |= CloseBy::Peer.bit();
	});

	if state == State::CloseWait && ctrl.ack_set() {
		table.with(handle, |c| c.reset_to_closed());
		table.finish_close_notify(handle);
		return;
	}

	if has_socket {
		table.with(handle, |c| c.reset_to_closed());
	} else {
		table.with(handle, |c| c.enqueue(None));
	}
	table.with(handle, |c| {
		c.state = State::CloseWait;
		c.close_time = Some(Instant::now());
	});
	table.notify_rx(handle);
	table.notify_tx(handle);
}

trait FinishClose {
	fn finish_close_notify(&self, handle: ConnHandle);
}

impl FinishClose for ConnTable {
	fn finish_close_notify(&self, handle: ConnHandle) {
		self.finish_close(handle);
	}
}

fn handle_data(table: &ConnTable, handle: ConnHandle, packet: &Packet, ctrl: Control) {
	let payload_has_data = packet.payload().len() > HEADER_LEN;

	let checks_ok = table.with(handle, |c| {
		let rdp = c.rdp.as_mut().unwrap();
		let seq_ok = between(ctrl.seq, rdp.rcv_cur.wrapping_add(1), rdp.rcv_cur.wrapping_add(2 * rdp.window));
		let ack_ok = between(ctrl.ack, rdp.snd_una.wrapping_sub(1).wrapping_sub(2 * rdp.window), rdp.snd_nxt.wrapping_sub(1));
		seq_ok && ack_ok
	});

	if !checks_ok {
		trace!("rdp: conn {}: packet outside window, dropping", handle.0);
		return;
	}

	table.with(handle, |c| {
		let una = c.rdp.as_ref().unwrap().snd_una;
		if before(una, ctrl.ack.wrapping_add(1)) {
			let rdp = c.rdp.as_mut().unwrap();
			rdp.snd_una = ctrl.ack.wrapping_add(1);
			rdp.tx_retry.retain(|e| !before(e.seq, rdp.snd_una));
		}
	});
	table.notify_tx(handle);

	if ctrl.eack() {
		let acked: Vec<u16> = packet.payload()[HEADER_LEN..].chunks_exact(2).map(|b| u16::from_be_bytes([b[0], b[1]])).collect();
		table.with(handle, |c| {
			let rdp = c.rdp.as_mut().unwrap();
			for e in &mut rdp.tx_retry {
				if acked.contains(&e.seq) {
					e.acked = true;
				}
			}
			rdp.tx_retry.retain(|e| !e.acked);
		});
		if !payload_has_data {
			return;
		}
	}

	if !payload_has_data && !ctrl.syn() {
		return;
	}

	let in_order = table.with(handle, |c| ctrl.seq == c.rdp.as_ref().unwrap().rcv_cur.wrapping_add(1));

	if in_order {
		deliver(table, handle, packet, ctrl.seq);
		drain_reorder(table, handle);
	} else {
		let dup = table.with(handle, |c| c.rdp.as_ref().unwrap().reorder.iter().any(|(s, _)| *s == ctrl.seq));
		if !dup {
			let cloned = crate::pool::Pool::global().clone_packet(packet);
			if let Ok(stored) = cloned {
				table.with(handle, |c| c.rdp.as_mut().unwrap().reorder.push((ctrl.seq, stored)));
			}
		}
		table.with(handle, |c| c.rdp.as_mut().unwrap().unacked_since_ack += 1);
		maybe_send_eack(table, handle);
	}

	maybe_ack(table, handle);
}

/// Strip the control header and push the remaining payload onto the
/// connection's rx queue. `packet`'s payload must be at least `HEADER_LEN`
/// bytes (callers only reach here once that has been checked).
fn deliver(table: &ConnTable, handle: ConnHandle, packet: &Packet, seq: u16) {
	table.with(handle, |c| c.rdp.as_mut().unwrap().rcv_cur = seq);

	let data = &packet.payload()[HEADER_LEN..];
	if let Ok(mut copy) = crate::pool::Pool::global().get(data.len()) {
		copy.id = packet.id;
		copy.length = data.len() as u16;
		copy.payload_mut().copy_from_slice(data);
		table.with(handle, |c| c.enqueue(Some(copy)));
	}

	table.notify_rx(handle);
}

fn drain_reorder(table: &ConnTable, handle: ConnHandle) {
	loop {
		let next = table.with(handle, |c| {
			let rdp = c.rdp.as_mut().unwrap();
			let want = rdp.rcv_cur.wrapping_add(1);
			rdp.reorder.iter().position(|(s, _)| *s == want)
		});

		let Some(idx) = next else { break };

		let packet = table.with(handle, |c| c.rdp.as_mut().unwrap().reorder.remove(idx).1);
		let seq = table.with(handle, |c| c.rdp.as_ref().unwrap().rcv_cur.wrapping_add(1));
		deliver(table, handle, &packet, seq);
	}
}

fn maybe_send_eack(table: &ConnTable, handle: ConnHandle) {
	let (idout, seq, listed) = table.with(handle, |c| {
		let rdp = c.rdp.as_ref().unwrap();
		(c.idout, rdp.rcv_cur, rdp.reorder.iter().map(|(s, _)| *s).collect::<Vec<_>>())
	});

	let Ok(mut packet) = crate::pool::Pool::global().get(HEADER_LEN + listed.len() * 2) else { return };
	packet.id = idout;
	packet.length = (HEADER_LEN + listed.len() * 2) as u16;
	Control { flags: ctl::EAK | ctl::ACK, seq, ack: seq }.write(&mut packet.payload_mut()[..HEADER_LEN]);
	for (i, s) in listed.iter().enumerate() {
		packet.payload_mut()[HEADER_LEN + i * 2..][..2].copy_from_slice(&s.to_be_bytes());
	}
	crate::router::send_packet(packet);
	table.with(handle, |c| c.rdp.as_mut().unwrap().last_ack_time = Instant::now());
}

fn maybe_ack(table: &ConnTable, handle: ConnHandle) {
	let should = table.with(handle, |c| {
		let free = crate::config::get().rdp_window_size as usize * 2;
		let used: usize = c.rx_queues.iter().map(VecDeque::len).sum();
		let rdp = c.rdp.as_ref().unwrap();
		!rdp.delayed_acks
			|| rdp.last_ack_time.elapsed() >= Duration::from_millis(rdp.ack_timeout_ms as u64)
			|| rdp.unacked_since_ack > rdp.ack_delay_count
			|| free.saturating_sub(used) < free
	});

	if !should {
		return;
	}

	let (idout, seq) = table.with(handle, |c| (c.idout, c.rdp.as_ref().unwrap().rcv_cur));
	send_control(&idout, ctl::ACK, seq, seq, None);
	table.with(handle, |c| {
		let rdp = c.rdp.as_mut().unwrap();
		rdp.unacked_since_ack = 0;
		rdp.last_ack_time = Instant::now();
	});
}

/// Send `packet`'s payload reliably: blocks while the window is full.
pub fn send(handle: ConnHandle, packet: Packet) -> Result {
	let table = ConnTable::global();

	let opened = table.wait_tx(handle, NO_TIMEOUT, |c| {
		c.state != State::Open
			|| {
				let rdp = c.rdp.as_ref().unwrap();
				!between(rdp.snd_nxt, rdp.snd_una, rdp.snd_una.wrapping_add(rdp.window).wrapping_sub(1))
			}
	});

	if !opened || table.with(handle, |c| c.state) != State::Open {
		return Err(Error::Reset);
	}

	let (idout, seq, ack) = table.with(handle, |c| {
		let rdp = c.rdp.as_mut().unwrap();
		let seq = rdp.snd_nxt;
		rdp.snd_nxt = rdp.snd_nxt.wrapping_add(1);
		(c.idout, seq, rdp.rcv_cur)
	});

	let body_len = packet.length as usize;
	let mut framed = crate::pool::Pool::global().get(HEADER_LEN + body_len)?;
	framed.id = idout;
	framed.length = (HEADER_LEN + body_len) as u16;
	Control { flags: ctl::ACK, seq, ack }.write(&mut framed.payload_mut()[..HEADER_LEN]);
	framed.payload_mut()[HEADER_LEN..].copy_from_slice(packet.payload());
	drop(packet);

	let retry = crate::pool::Pool::global().clone_packet(&framed)?;
	table.with(handle, |c| {
		let rdp = c.rdp.as_mut().unwrap();
		rdp.tx_retry.push_back(TxEntry { seq, packet: retry, sent_at: Instant::now(), acked: false });
		rdp.last_ack_time = Instant::now();
		rdp.unacked_since_ack = 0;
	});

	crate::router::send_packet(framed);
	Ok(())
}

/// Close a reliable connection. Returns `Error::Busy` while waiting out the peer's acknowledgement.
pub fn close(handle: ConnHandle, by: CloseBy) -> Result {
	let table = ConnTable::global();

	let already_set = table.with(handle, |c| c.closed_by & by.bit() != 0);
	if already_set {
		return Err(Error::Busy);
	}

	let first = table.with(handle, |c| c.closed_by == 0);

	table.with(handle, |c| {
		c.closed_by |= by.bit();
		if first {
			c.state = State::CloseWait;
			c.close_time = Some(Instant::now());
		}
	});

	if first && !matches!(by, CloseBy::Peer) {
		let idout = table.with(handle, |c| c.idout);
		send_control(&idout, ctl::RST | ctl::ACK, 0, 0, None);
	}
	table.notify_tx(handle);

	if table.with(handle, |c| c.closed_by == 0b111) {
		table.finish_close(handle);
		return Ok(());
	}

	Err(Error::Busy)
}

/// Walk every open reliable connection: expire timed-out handshakes/closes,
/// retransmit unacknowledged packets past `packet_timeout_ms`. Invoked once
/// per router-loop iteration.
pub fn scan_timeouts(conn_table_size: usize) {
	let table = ConnTable::global();

	for i in 0..conn_table_size {
		let handle = ConnHandle(i);
		let state = table.with(handle, |c| c.state);

		match state {
			State::SynSent => {
				let expired = table.with(handle, |c| c.opened_at.elapsed() >= Duration::from_millis(c.rdp.as_ref().unwrap().conn_timeout_ms as u64));
				if expired {
					table.with(handle, |c| c.reset_to_closed());
					table.notify_tx(handle);
				}
			}
			State::CloseWait => {
				let expired = table.with(handle, |c| {
					let timeout = c.rdp.as_ref().unwrap().conn_timeout_ms as u64;
					c.close_time.is_some_and(|t| t.elapsed() >= Duration::from_millis(timeout))
				});
				if expired {
					let _ = close(handle, CloseBy::Timeout);
				}
			}
			State::Open => retransmit(table, handle),
			_ => {}
		}
	}
}

fn retransmit(table: &ConnTable, handle: ConnHandle) {
	let due: Vec<u16> = table.with(handle, |c| {
		let rdp = c.rdp.as_mut().unwrap();
		let timeout = Duration::from_millis(rdp.packet_timeout_ms as u64);
		rdp.tx_retry.iter().filter(|e| !e.acked && e.sent_at.elapsed() >= timeout).map(|e| e.seq).collect()
	});

	if due.is_empty() {
		return;
	}

	let (idout, ack) = table.with(handle, |c| (c.idout, c.rdp.as_ref().unwrap().rcv_cur));

	for seq in due {
		let resend = table.with(handle, |c| {
			let rdp = c.rdp.as_mut().unwrap();
			let entry = rdp.tx_retry.iter_mut().find(|e| e.seq == seq)?;
			entry.sent_at = Instant::now();
			crate::pool::Pool::global().clone_packet(&entry.packet).ok()
		});

		if let Some(mut packet) = resend {
			Control { flags: ctl::ACK, seq, ack }.write(&mut packet.payload_mut()[..HEADER_LEN]);
			packet.id = idout;
			crate::router::send_packet(packet);
		}
	}
}

#[cfg(test)]
mod tests {
	use std::time::Duration;

	use crate::{config, opt, Socket};

	/// SYN / SYN+ACK / ACK handshake followed by one reliable exchange, all
	/// over loopback. Exercises [`connect`], [`accept`] and [`send`] together.
	#[test]
	fn reliable_handshake_and_exchange() {
		crate::test_support::init();
		let cfg = config::get();
		let port = 21;

		let server = Socket::bind(port).unwrap();
		let client = Socket::connect(cfg.address, port, 0, opt::RDP, Duration::from_millis(500)).unwrap();

		let accepted = server.accept(Duration::from_secs(1)).unwrap();

		client.send(b"reliable hello").unwrap();
		let data = accepted.recv(Duration::from_secs(1)).unwrap();
		assert_eq!(data.as_deref(), Some(&b"reliable hello"[..]));

		accepted.send(b"ack from server").unwrap();
		let reply = client.recv(Duration::from_secs(1)).unwrap();
		assert_eq!(reply.as_deref(), Some(&b"ack from server"[..]));
	}
}
