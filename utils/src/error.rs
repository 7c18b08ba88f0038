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

pub type Result<T = (), E = ()> = result::Result<T, E>;

use core::result;
use std::fmt;
use std::io;

pub use Ext as _;

/// Errors that cross a public boundary of the stack (`open`, `read_packet`,
/// `write_packet`, `accept`). Everything else (a malformed header, a
/// transient read failure mid-loop) is handled locally: logged at the
/// point of failure and folded into a dropped packet, never propagated as
/// one of these variants.
#[derive(Debug)]
pub enum Error {
	/// The tunnel file object could not be acquired or configured.
	DeviceOpen(io::Error),
	/// The tunnel's ingress or egress queue is closed; the device is gone.
	DeviceClosed,
	/// The accept queue is closed; no more connections will ever arrive.
	AcceptClosed,
	/// An IPv4 or TCP header was too short or otherwise malformed.
	BadHeader,
	/// A read or write on the tunnel failed transiently.
	IoTransient(io::Error),
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::DeviceOpen(err) => write!(f, "failed to open tunnel device: {err}"),
			Error::DeviceClosed => write!(f, "tunnel device is closed"),
			Error::AcceptClosed => write!(f, "accept queue is closed"),
			Error::BadHeader => write!(f, "malformed packet header"),
			Error::IoTransient(err) => write!(f, "transient tunnel I/O error: {err}"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Error::DeviceOpen(err) | Error::IoTransient(err) => Some(err),
			Error::DeviceClosed | Error::AcceptClosed | Error::BadHeader => None,
		}
	}
}
