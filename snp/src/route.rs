//! Routing table: a CIDR-only linked list, per `csp_rtable_cidr.c`. The
//! fixed-slot legacy table libcsp also ships is deliberately not reproduced.

use std::sync::{Arc, Mutex, OnceLock};

use crate::iface::Interface;

/// "No via" sentinel: the next hop is the destination itself, reached directly.
pub const NO_VIA: u16 = u16::MAX;

#[derive(Clone)]
pub struct Route {
	pub prefix: u16,
	pub netmask: u8,
	pub iface: Arc<Interface>,
	pub via: u16,
}

struct Table {
	entries: Mutex<Vec<Route>>,
}

static TABLE: OnceLock<Table> = OnceLock::new();

pub(crate) fn init() {
	let _ = TABLE.set(Table { entries: Mutex::new(Vec::new()) });
	clear();
}

fn table() -> &'static Table {
	TABLE.get().expect("snp::init was not called")
}

/// The comparison mask for a route's top `netmask` address bits, within the
/// configured header version's address width.
fn network_mask(netmask: u8) -> u16 {
	let host_bits = crate::header::host_bits();
	let bits = (netmask as u32).min(host_bits);
	if bits == 0 {
		return 0;
	}
	(((1u32 << bits) - 1) << (host_bits - bits)) as u16
}

/// Install or update a route. `(prefix == 0 && netmask == 0)` installs the default route.
pub fn set(prefix: u16, netmask: u8, iface: Arc<Interface>, via: u16) {
	let mut entries = table().entries.lock().unwrap();

	if let Some(existing) = entries.iter_mut().find(|r| r.prefix == prefix && r.netmask == netmask) {
		existing.iface = iface;
		existing.via = via;
		return;
	}

	entries.push(Route { prefix, netmask, iface, via });
}

/// Longest-prefix-match lookup; an exact destination match short-circuits
/// immediately, otherwise ties on netmask width favor the later-inserted entry.
pub fn lookup(dst: u16) -> Option<Route> {
	let entries = table().entries.lock().unwrap();

	for r in entries.iter() {
		if r.prefix == dst && r.netmask as u32 == crate::header::host_bits() {
			return Some(r.clone());
		}
	}

	let mut best: Option<&Route> = None;

	for r in entries.iter() {
		let mask = network_mask(r.netmask);
		if (dst & mask) == (r.prefix & mask) {
			match best {
				Some(b) if b.netmask > r.netmask => {}
				_ => best = Some(r),
			}
		}
	}

	best.cloned()
}

pub fn iterate() -> Vec<Route> {
	table().entries.lock().unwrap().clone()
}

/// Drop every route and reinstall the loopback route for the local address.
pub fn clear() {
	let mut entries = table().entries.lock().unwrap();
	entries.clear();

	let cfg = crate::config::get();
	if let Some(lo) = crate::iface::find(crate::iface::LOOPBACK_NAME) {
		entries.push(Route { prefix: cfg.address, netmask: crate::header::host_bits() as u8, iface: lo, via: NO_VIA });
	}
}

/// Render the table in `addr[/mask] ifname[, via]` form, omitting loopback.
pub fn save() -> String {
	let mut out = String::new();

	for r in iterate() {
		if r.iface.name == crate::iface::LOOPBACK_NAME {
			continue;
		}

		let full_mask = r.netmask as u32 == crate::header::host_bits();
		if full_mask {
			out.push_str(&format!("{}", r.prefix));
		} else {
			out.push_str(&format!("{}/{}", r.prefix, r.netmask));
		}
		out.push(' ');
		out.push_str(&r.iface.name);

		if r.via != NO_VIA {
			out.push_str(&format!(", {}", r.via));
		}
		out.push('\n');
	}

	out
}
