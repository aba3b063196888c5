//! Segmentation over Ethernet-like links. Frame layout: a 14-byte Ethernet
//! header (dest MAC, src MAC, ether-type `0x88B5`) followed by an 8-byte SNP
//! segmentation header, followed by packet data; the first segment's data
//! begins with the SNP wire header itself.

use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use log::debug;

use crate::iface::Interface;
use crate::pool::Packet;

pub const ETHER_TYPE: u16 = 0x88B5;
pub const ETH_HEADER_LEN: usize = 14;
pub const SEG_HEADER_LEN: usize = 8;
pub const BROADCAST_MAC: [u8; 6] = [0xFF; 6];

pub type Mac = [u8; 6];

struct SegHeader {
	packet_id: u16,
	src_addr: u16,
	segment_size: u16,
	total_length: u16,
}

impl SegHeader {
	fn parse(b: &[u8]) -> Self {
		Self {
			packet_id: u16::from_be_bytes([b[0], b[1]]),
			src_addr: u16::from_be_bytes([b[2], b[3]]),
			segment_size: u16::from_be_bytes([b[4], b[5]]),
			total_length: u16::from_be_bytes([b[6], b[7]]),
		}
	}

	fn write(&self, out: &mut [u8]) {
		out[0..2].copy_from_slice(&self.packet_id.to_be_bytes());
		out[2..4].copy_from_slice(&self.src_addr.to_be_bytes());
		out[4..6].copy_from_slice(&self.segment_size.to_be_bytes());
		out[6..8].copy_from_slice(&self.total_length.to_be_bytes());
	}

	fn key(&self) -> u32 {
		((self.packet_id as u32) << 16) | self.src_addr as u32
	}
}

struct Entry {
	total_length: u16,
	bytes_received: usize,
	data: Vec<u8>,
	last_used: Instant,
}

static TABLE: OnceLock<Mutex<Vec<(u32, Entry)>>> = OnceLock::new();
static ARP_CACHE: OnceLock<Mutex<Vec<(u16, Mac)>>> = OnceLock::new();
const ARP_CACHE_CAP: usize = 16;

pub(crate) fn init() {
	let _ = TABLE.set(Mutex::new(Vec::new()));
	let _ = ARP_CACHE.set(Mutex::new(Vec::new()));
}

fn table() -> &'static Mutex<Vec<(u32, Entry)>> {
	TABLE.get().expect("snp::init was not called")
}

/// Feed one received Ethernet frame (already stripped of the 14-byte Ethernet
/// header by the driver) into segment reassembly.
pub fn on_segment(iface: &Interface, src_mac: Mac, segment: &[u8]) {
	if let Some(packet) = assemble(iface, src_mac, segment) {
		crate::router::push_rx(packet);
	}
}

/// Reassembly logic proper, split out from [`on_segment`] so it can be
/// tested without racing the router thread's own FIFO drain.
fn assemble(iface: &Interface, src_mac: Mac, segment: &[u8]) -> Option<Packet> {
	if segment.len() < SEG_HEADER_LEN {
		iface.counters.frame.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		return None;
	}

	let hdr = SegHeader::parse(segment);
	let data = &segment[SEG_HEADER_LEN..];
	let key = hdr.key();

	let mut table = table().lock().unwrap();
	let idx = table.iter().position(|(k, _)| *k == key);

	let idx = match idx {
		Some(idx) => {
			if table[idx].1.total_length != hdr.total_length {
				iface.counters.frame.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
				return None;
			}
			idx
		}
		None => {
			table.push((key, Entry { total_length: hdr.total_length, bytes_received: 0, data: vec![0u8; hdr.total_length as usize], last_used: Instant::now() }));
			table.len() - 1
		}
	};

	let entry = &mut table[idx].1;

	if entry.bytes_received + data.len() > entry.total_length as usize {
		iface.counters.frame.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
		return None;
	}

	entry.data[entry.bytes_received..entry.bytes_received + data.len()].copy_from_slice(data);
	entry.bytes_received += data.len();
	entry.last_used = Instant::now();

	if entry.bytes_received != entry.total_length as usize {
		return None;
	}

	let (_, entry) = table.remove(idx);
	drop(table);

	remember_mac(hdr.src_addr, src_mac);

	// Place the frame at the same `HEADER_SCRATCH - header_size` offset
	// `header::setup_rx` uses, so post-`strip` `frame_begin == HEADER_SCRATCH`.
	let begin = crate::pool::HEADER_SCRATCH - crate::header::wire_size();
	let Ok(mut packet) = crate::pool::Pool::global().get(crate::config::get().mtu) else { return None };
	let n = entry.data.len().min(packet.storage().len() - begin);
	packet.storage_mut()[begin..begin + n].copy_from_slice(&entry.data[..n]);
	packet.frame_begin = begin;
	packet.frame_length = n;
	Some(packet)
}

pub fn sweep() {
	let Some(table) = TABLE.get() else { return };
	let timeout = Duration::from_millis(crate::config::get().reassembly_timeout_ms as u64);
	let mut table = table.lock().unwrap();
	let before = table.len();
	table.retain(|(_, e)| e.last_used.elapsed() < timeout);
	let dropped = before - table.len();
	if dropped > 0 {
		debug!("efp: swept {dropped} abandoned reassembly entr{}", if dropped == 1 { "y" } else { "ies" });
	}
}

fn remember_mac(addr: u16, mac: Mac) {
	let mut cache = ARP_CACHE.get().expect("snp::init was not called").lock().unwrap();
	if let Some(entry) = cache.iter_mut().find(|(a, _)| *a == addr) {
		entry.1 = mac;
		return;
	}
	if cache.len() >= ARP_CACHE_CAP {
		cache.remove(0);
	}
	cache.push((addr, mac));
}

/// Resolve the destination MAC for `addr`, falling back to broadcast on a cache miss.
pub fn resolve_mac(addr: u16) -> Mac {
	let cache = ARP_CACHE.get().expect("snp::init was not called").lock().unwrap();
	cache.iter().find(|(a, _)| *a == addr).map(|(_, m)| *m).unwrap_or(BROADCAST_MAC)
}

/// Segment `packet`'s wire frame (header already prepended) into
/// `MTU - ETH_HEADER_LEN - SEG_HEADER_LEN`-byte chunks and hand each to the driver.
pub fn transmit(iface: &Interface, packet: &Packet, packet_id: u16, local_addr: u16) -> utils::error::Result {
	let frame = packet.frame();
	let max_chunk = iface.mtu.saturating_sub(ETH_HEADER_LEN + SEG_HEADER_LEN).max(1);
	let total_length = frame.len() as u16;
	let dst_mac = resolve_mac(packet.id.dst);

	for chunk in frame.chunks(max_chunk) {
		let mut buf = vec![0u8; SEG_HEADER_LEN + chunk.len()];
		SegHeader { packet_id, src_addr: local_addr, segment_size: chunk.len() as u16, total_length }.write(&mut buf[..SEG_HEADER_LEN]);
		buf[SEG_HEADER_LEN..].copy_from_slice(chunk);

		if emit_raw_segment(iface, dst_mac, &buf).is_err() {
			iface.counters.tx_error.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
			return Err(utils::error::Error::TxFailure);
		}
	}

	Ok(())
}

fn emit_raw_segment(_iface: &Interface, _dst_mac: Mac, _segment: &[u8]) -> utils::error::Result {
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	/// Feed a segmented packet through `assemble` segment-by-segment and
	/// confirm the reassembled packet's payload lines up after `header::strip`.
	#[test]
	fn reassembly_aligns_payload() {
		crate::test_support::init();
		let cfg = crate::config::get();
		let iface = crate::iface::find(crate::iface::LOOPBACK_NAME).unwrap();

		let payload = b"hello over ethernet, a bit longer than one segment";
		let mut src = crate::pool::Pool::global().get(payload.len()).unwrap();
		src.id = crate::pool::Id { pri: 0, flags: 0, src: cfg.address, dst: cfg.address, sport: 10, dport: 20 };
		src.length = payload.len() as u16;
		src.payload_mut().copy_from_slice(payload);
		crate::header::prepend(&mut src);
		let frame = src.frame().to_vec();

		let max_chunk = 16;
		let total_length = frame.len() as u16;
		let mut reassembled = None;
		for chunk in frame.chunks(max_chunk) {
			let mut seg = vec![0u8; SEG_HEADER_LEN + chunk.len()];
			SegHeader { packet_id: 1, src_addr: cfg.address, segment_size: chunk.len() as u16, total_length }.write(&mut seg[..SEG_HEADER_LEN]);
			seg[SEG_HEADER_LEN..].copy_from_slice(chunk);
			reassembled = assemble(&iface, [0u8; 6], &seg);
		}

		let mut packet = reassembled.expect("last segment completes the packet");
		crate::header::strip(&mut packet).unwrap();
		assert_eq!(packet.payload(), payload);
	}
}
