use bilge::prelude::*;
use utils::bytes::Cast;
use utils::endian::b;
use utils::error::{Error, Result};

use crate::config::{self, HeaderVersion};
use crate::pool::{Id, Packet, HEADER_SCRATCH};

/// Header v1: 32 bits big-endian, `[pri:2][src:5][dst:5][dport:6][sport:6][flags:8]`.
#[bitsize(32)]
#[derive(FromBits, Clone, Copy)]
struct RawV1 {
	flags: u8,
	sport: u6,
	dport: u6,
	dst: u5,
	src: u5,
	pri: u2,
}

/// Header v2: 48 meaningful bits left-justified in a 64-bit big-endian word
/// (the low 16 bits are the padding introduced by the source's
/// "shift left 16 before storing" packing trick).
#[bitsize(64)]
#[derive(FromBits, Clone, Copy)]
struct RawV2 {
	pad: u16,
	flags: u6,
	sport: u6,
	dport: u6,
	src: u14,
	dst: u14,
	pri: u2,
}

fn size_of_version(v: HeaderVersion) -> usize {
	match v {
		HeaderVersion::V1 => core::mem::size_of::<b<RawV1>>(),
		HeaderVersion::V2 => core::mem::size_of::<b<RawV2>>(),
	}
}

/// Size in bytes of the packed wire header for the configured version.
/// Reassembly layers (CFP, EFP) need this to place a frame at the same
/// `HEADER_SCRATCH - size` offset [`setup_rx`] uses, so `strip` sees the
/// `frame_begin == HEADER_SCRATCH` invariant it expects once it advances past the header.
pub fn wire_size() -> usize {
	size_of_version(config::get().header_version)
}

/// Position the frame-begin pointer to leave exactly enough room in the
/// reserved scratch for the configured header version, so the driver can
/// read an incoming wire frame directly into place without a copy.
pub fn setup_rx(packet: &mut Packet) {
	let size = size_of_version(config::get().header_version);
	packet.frame_begin = HEADER_SCRATCH - size;
	packet.frame_length = 0;
}

/// Copy `packet.id` into the scratch area immediately before the payload, in
/// big-endian wire order, and set the frame span to cover header + payload.
pub fn prepend(packet: &mut Packet) {
	let version = config::get().header_version;
	let size = size_of_version(version);
	let begin = HEADER_SCRATCH - size;

	let id = packet.id;

	match version {
		HeaderVersion::V1 => {
			let raw = RawV1::new(id.flags, u6::new(id.sport & 0x3F), u6::new(id.dport & 0x3F), u5::new(id.dst as u8 & 0x1F), u5::new(id.src as u8 & 0x1F), u2::new(id.pri & 0x3));
			let wire: &mut b<RawV1> = utils::bytes::cast_mut(&mut packet.storage_mut()[begin..][..size]);
			*wire = raw.into();
		}
		HeaderVersion::V2 => {
			let raw = RawV2::new(
				0u16,
				u6::new(id.flags & 0x3F),
				u6::new(id.sport & 0x3F),
				u6::new(id.dport & 0x3F),
				u14::new(id.src & 0x3FFF),
				u14::new(id.dst & 0x3FFF),
				u2::new(id.pri & 0x3),
			);
			let wire: &mut b<RawV2> = utils::bytes::cast_mut(&mut packet.storage_mut()[begin..][..size]);
			*wire = raw.into();
		}
	}

	packet.frame_begin = begin;
	packet.frame_length = size + packet.length as usize;
}

/// Reverse of [`prepend`]: parse the wire header at `frame_begin` into
/// `packet.id`, and advance `frame_begin` past it. Fails if the frame is
/// shorter than the configured header size.
pub fn strip(packet: &mut Packet) -> Result {
	let version = config::get().header_version;
	let size = size_of_version(version);

	if packet.frame_length < size {
		return Err(Error::InvalidArgument);
	}

	let begin = packet.frame_begin;

	let id = match version {
		HeaderVersion::V1 => {
			let wire: &b<RawV1> = utils::bytes::cast(&packet.storage()[begin..][..size]);
			let raw: RawV1 = wire.get();
			Id {
				pri: raw.pri().value(),
				src: raw.src().value() as u16,
				dst: raw.dst().value() as u16,
				dport: raw.dport().value(),
				sport: raw.sport().value(),
				flags: raw.flags(),
			}
		}
		HeaderVersion::V2 => {
			let wire: &b<RawV2> = utils::bytes::cast(&packet.storage()[begin..][..size]);
			let raw: RawV2 = wire.get();
			Id {
				pri: raw.pri().value(),
				src: raw.src().value(),
				dst: raw.dst().value(),
				dport: raw.dport().value(),
				sport: raw.sport().value(),
				flags: raw.flags().value(),
			}
		}
	};

	packet.id = id;
	packet.frame_begin += size;
	packet.length = (packet.frame_length - size) as u16;

	Ok(())
}

/// Width in bits of the source/destination address fields for the configured version.
pub fn host_bits() -> u32 {
	config::get().header_version.host_bits()
}

/// Largest representable node address (also the global broadcast address).
pub fn max_nodeid() -> u16 {
	config::get().header_version.max_nodeid()
}

/// Largest representable port number / the reserved wildcard port value.
pub fn max_port() -> u8 {
	config::get().header_version.max_port()
}

/// Whether `addr` is a broadcast address for `netmask` (all host bits set, or
/// the global broadcast address).
pub fn is_broadcast(addr: u16, netmask: u8) -> bool {
	let bits = host_bits();
	let host_width = bits.saturating_sub(netmask as u32);
	let hostmask: u16 = if host_width >= 16 { 0xFFFF } else { (1u16 << host_width) - 1 };

	(addr & hostmask) == hostmask || addr == max_nodeid()
}

#[cfg(test)]
mod tests {
	use super::*;

	/// `strip(prepend(H)) == H`, for the version selected by test setup (§8).
	#[test]
	fn roundtrip() {
		crate::test_support::init();

		let mut p = crate::pool::Pool::global().get(8).unwrap();
		let want = Id { pri: 1, flags: crate::pool::flags::RDP | crate::pool::flags::CRC32, src: 7, dst: 3, dport: 10, sport: 20 };

		p.id = want;
		p.length = 0;
		setup_rx(&mut p);
		prepend(&mut p);
		p.frame_length = size_of_version(config::get().header_version);
		strip(&mut p).unwrap();

		assert_eq!(p.id, want);
	}
}
