use core::fmt;

/// Abstract error kind surfaced by a fallible SNP operation.
///
/// Every operation that can fail returns one of a small closed set of kinds
/// rather than a detailed diagnostic; detail, when it exists, is logged at
/// the call site instead of carried in the type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
	/// Pool, queue, or table exhaustion.
	OutOfMemory,
	/// Caller-supplied argument outside the valid range.
	InvalidArgument,
	/// A blocking operation exceeded its caller-supplied timeout.
	TimedOut,
	/// Transient driver condition; retry later.
	Busy,
	/// Operation is not applicable in the current state (e.g. double bind).
	Already,
	/// Peer closed the connection, or an RST was observed.
	Reset,
	/// The link driver reported a transmit failure.
	TxFailure,
	/// Feature compiled out or not enabled for this build.
	NotSupported,
	/// HMAC or XTEA authentication rejected the packet.
	AuthFailure,
	/// CRC32 check failed.
	CrcMismatch,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let s = match self {
			Error::OutOfMemory => "out of memory",
			Error::InvalidArgument => "invalid argument",
			Error::TimedOut => "timed out",
			Error::Busy => "busy",
			Error::Already => "already",
			Error::Reset => "reset",
			Error::TxFailure => "tx failure",
			Error::NotSupported => "not supported",
			Error::AuthFailure => "auth failure",
			Error::CrcMismatch => "crc mismatch",
		};
		f.write_str(s)
	}
}

pub type Result<T = (), E = Error> = result::Result<T, E>;

#[doc(hidden)]
pub trait Ext<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T>;
}

impl<T, E> Ext<T, E> for result::Result<T, E> {
	fn ok_or(self, f: impl FnOnce(E)) -> Option<T> {
		match self {
			Ok(v) => Some(v),
			Err(e) => {
				f(e);
				None
			}
		}
	}
}

#[doc(hidden)]
pub trait ExtOpaque<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T>;
}

impl<T> ExtOpaque<T> for Option<T> {
	fn some_or(self, f: impl FnOnce()) -> Option<T> {
		match self {
			Some(_) => {}
			None => f(),
		}

		self
	}
}

use core::result;

pub use Ext as _;
