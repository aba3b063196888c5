//! Small Node Protocol: a connection-oriented network stack for
//! resource-constrained nodes, modeled on libcsp.

pub mod cfp;
pub mod config;
pub mod conn;
pub mod efp;
pub mod header;
pub mod iface;
pub mod pool;
pub mod port;
pub mod rdp;
pub mod route;
pub mod router;
pub mod service;

#[cfg(test)]
pub(crate) mod test_support;

use std::time::Duration;

use utils::error::{Error, Result};

use conn::{ConnHandle, ConnTable, Kind, State};
use pool::{flags, Id};

/// Bring the whole stack up: install configuration, allocate the buffer
/// pool, size every table, and start the router thread. Must be called
/// exactly once before any other operation.
pub fn init(cfg: config::Config) -> Result<&'static config::Config> {
	let cfg = config::init(cfg);

	pool::Pool::init(cfg.pool_slots, cfg.mtu);
	ConnTable::init(cfg.conn_table_size);
	port::init(header::max_port());
	iface::init();
	route::init();
	router::init();
	cfp::init();
	efp::init();
	service::init();

	bind_service_ports();
	router::start();

	Ok(cfg)
}

/// Shut the router thread down. Mainly useful for tests that need a clean
/// process-wide state between runs; production embedders normally never call this.
pub fn shutdown() {
	router::stop();
}

struct ServiceCallback;

impl port::Callback for ServiceCallback {
	fn call(&self, packet: pool::Packet) {
		service::handle(&packet);
	}
}

fn bind_service_ports() {
	for port in [config::ports::CMP, config::ports::PING, config::ports::PS, config::ports::MEMFREE, config::ports::REBOOT, config::ports::BUF_FREE, config::ports::UPTIME] {
		let _ = port::bind_callback(port, Box::new(ServiceCallback));
	}
}

/// Socket options requested at `connect`/`bind` time, OR'd into the header's flags byte.
pub mod opt {
	pub const NONE: u8 = 0;
	pub use crate::pool::flags::{CRC32, HMAC, RDP};
}

/// A user-facing handle: either a listening socket bound to a port, or an
/// open connection (client- or server-side).
pub enum Socket {
	Listening(u8),
	Connected(ConnHandle),
}

impl Socket {
	/// Bind a listening socket to `port`.
	pub fn bind(port: u8) -> Result<Self> {
		port::bind(port)?;
		Ok(Self::Listening(port))
	}

	/// Block for up to `timeout` for an incoming connection on a bound port.
	/// Only valid on a socket returned by [`bind`](Socket::bind).
	pub fn accept(&self, timeout: Duration) -> Result<Self> {
		let Self::Listening(port) = *self else { return Err(Error::InvalidArgument) };
		port::accept(port, timeout).map(Self::Connected).ok_or(Error::TimedOut)
	}

	/// Open a connection to `(dst, dport)` with the given option flags.
	pub fn connect(dst: u16, dport: u8, pri: u8, options: u8, timeout: Duration) -> Result<Self> {
		let table = ConnTable::global();
		let cfg = config::get();

		let sport = table.alloc_ephemeral(dst, dport)?;
		let handle = table.allocate(Kind::Client)?;

		let idout = Id { src: cfg.address, dst, sport, dport, pri, flags: options };
		let idin = Id { src: dst, dst: cfg.address, sport: dport, dport: sport, pri: 0, flags: options };
		table.with(handle, |c| {
			c.idout = idout;
			c.idin = idin;
		});

		if options & flags::RDP != 0 {
			rdp::connect(handle, idout)?;
		} else {
			table.with(handle, |c| c.state = State::Open);
		}

		let _ = timeout;
		Ok(Self::Connected(handle))
	}

	fn handle(&self) -> Result<ConnHandle> {
		match *self {
			Self::Connected(h) => Ok(h),
			Self::Listening(_) => Err(Error::InvalidArgument),
		}
	}

	/// Send `data` on this connection.
	pub fn send(&self, data: &[u8]) -> Result {
		let handle = self.handle()?;
		let table = ConnTable::global();
		let (idout, reliable, state) = table.with(handle, |c| (c.idout, c.idout.flags & flags::RDP != 0, c.state));

		if state != State::Open {
			return Err(Error::Reset);
		}

		let mut packet = pool::Pool::global().get(data.len())?;
		packet.id = idout;
		packet.length = data.len() as u16;
		packet.payload_mut().copy_from_slice(data);

		if reliable {
			rdp::send(handle, packet)
		} else {
			router::send_packet(packet);
			Ok(())
		}
	}

	/// Block for up to `timeout` for the next payload on this connection.
	/// Returns `Ok(None)` once the peer has closed and no more data remains.
	pub fn recv(&self, timeout: Duration) -> Result<Option<Vec<u8>>> {
		let handle = self.handle()?;
		let table = ConnTable::global();

		if !table.wait_rx(handle, timeout)? {
			return Err(Error::TimedOut);
		}

		let popped = table.with(handle, |c| {
			for q in &mut c.rx_queues {
				if let Some(p) = q.pop_front() {
					return Some(p);
				}
			}
			None
		});

		Ok(popped.map(|p| p.payload().to_vec()))
	}

	pub fn close(self) -> Result {
		match self {
			Self::Connected(handle) => ConnTable::global().close(handle),
			Self::Listening(port) => {
				port::unbind(port);
				Ok(())
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn loopback_datagram() {
		test_support::init();

		let server = Socket::bind(20).unwrap();
		let client = Socket::connect(config::get().address, 20, 0, opt::NONE, Duration::from_millis(100)).unwrap();

		client.send(b"hello").unwrap();

		let accepted = server.accept(Duration::from_secs(1)).unwrap();
		let data = accepted.recv(Duration::from_secs(1)).unwrap();
		assert_eq!(data.as_deref(), Some(&b"hello"[..]));
	}
}
