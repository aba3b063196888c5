use std::sync::OnceLock;

/// Which wire header layout is in effect for this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderVersion {
	/// 32-bit header: 5-bit addressing.
	V1,
	/// 48-bit header packed into a 64-bit word: 14-bit addressing.
	V2,
}

impl HeaderVersion {
	/// Width in bits of the source/destination address fields.
	pub const fn host_bits(self) -> u32 {
		match self {
			HeaderVersion::V1 => 5,
			HeaderVersion::V2 => 14,
		}
	}

	/// Width in bits of the port fields (identical in both versions).
	pub const fn port_bits(self) -> u32 {
		6
	}

	/// Largest representable node address; doubles as the broadcast address.
	pub const fn max_nodeid(self) -> u16 {
		((1u32 << self.host_bits()) - 1) as u16
	}

	/// Largest representable port number, also the reserved wildcard ("any port") value.
	pub const fn max_port(self) -> u8 {
		((1u32 << self.port_bits()) - 1) as u8
	}
}

/// Sentinel timeout meaning "never time out", per the wire convention.
pub const TIMEOUT_NEVER: u32 = 0xFFFF_FFFF;

/// Reserved built-in service ports (§6).
pub mod ports {
	pub const CMP: u8 = 0;
	pub const PING: u8 = 1;
	pub const PS: u8 = 2;
	pub const MEMFREE: u8 = 3;
	pub const REBOOT: u8 = 4;
	pub const BUF_FREE: u8 = 5;
	pub const UPTIME: u8 = 6;
}

/// Process-wide configuration, set once at [`init`](crate::init) and read-only thereafter.
#[derive(Debug, Clone)]
pub struct Config {
	pub header_version: HeaderVersion,
	pub address: u16,
	pub netmask: u8,
	pub hostname: &'static str,
	pub model: &'static str,
	pub revision: &'static str,

	pub pool_slots: usize,
	pub mtu: usize,

	pub conn_table_size: usize,
	/// First port handed out by ephemeral source-port allocation; ports at or
	/// below `max_bindable_port` are reserved for explicit `bind`.
	pub max_bindable_port: u8,

	pub rdp_window_size: u16,
	pub rdp_conn_timeout_ms: u32,
	pub rdp_packet_timeout_ms: u32,
	pub rdp_delayed_acks: bool,
	pub rdp_ack_timeout_ms: u32,
	pub rdp_ack_delay_count: u16,

	pub reassembly_timeout_ms: u32,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			header_version: HeaderVersion::V1,
			address: 1,
			netmask: 5,
			hostname: "snp-node",
			model: "generic",
			revision: "0.1.0",

			pool_slots: 64,
			mtu: 256,

			conn_table_size: 10,
			max_bindable_port: 47,

			rdp_window_size: 4,
			rdp_conn_timeout_ms: 10_000,
			rdp_packet_timeout_ms: 1_000,
			rdp_delayed_acks: true,
			rdp_ack_timeout_ms: 250,
			rdp_ack_delay_count: 2,

			reassembly_timeout_ms: 1_000,
		}
	}
}

static CONFIG: OnceLock<Config> = OnceLock::new();

/// Install the process-wide configuration. Must be called exactly once,
/// before any other SNP operation; later calls are ignored and a reference
/// to the first-installed configuration is returned.
pub fn init(config: Config) -> &'static Config {
	CONFIG.get_or_init(|| config)
}

/// Get the process-wide configuration.
///
/// # Panics
/// Panics if [`init`] has not yet been called.
pub fn get() -> &'static Config {
	CONFIG.get().expect("snp::config::init was not called")
}
