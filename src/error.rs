/*!
# Error taxonomy for the socket core

Argument and state errors are raised synchronously on the calling (Lua)
thread. Transport-level failures are captured as [`SysError`] values carrying
the syscall, the symbolic code and the raw errno, and are delivered through
the `connectError`/`error`/`close` callback paths.
*/
use std::fmt;
use std::io;
use std::sync::Arc;

use mlua::prelude::*;


/**
Synchronously raised usage errors.
*/
#[derive(Debug, Clone)]
pub(crate) enum ArgError {
	/// The supplied option/argument shape is wrong.
	InvalidArguments(String),

	/// The operation is not valid for the engine's current state.
	InvalidState(&'static str),

	/// The handler record carries neither a `data` nor a `drain` callback.
	MissingCallback,
}

impl fmt::Display for ArgError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::InvalidArguments(msg) => write!(f, "invalid arguments: {}", msg),
			Self::InvalidState(msg) => write!(f, "invalid state: {}", msg),
			Self::MissingCallback => f.write_str("at least one of the data or drain callbacks is required"),
		}
	}
}

impl std::error::Error for ArgError {}

impl From<ArgError> for LuaError {
	fn from(other: ArgError) -> Self {
		LuaError::ExternalError(Arc::new(other))
	}
}


/**
Structured transport error.

Carries everything the script needs to render a useful failure message:
the syscall, the symbolic POSIX code, the raw errno and, where applicable,
the address and port involved.
*/
#[derive(Debug, Clone)]
pub(crate) struct SysError {
	pub(crate) syscall: &'static str,
	pub(crate) code: String,
	pub(crate) errno: i32,
	pub(crate) message: String,
	pub(crate) address: Option<String>,
	pub(crate) port: Option<u16>,
}

#[cfg(unix)]
fn errno_code(errno: i32) -> String {
	format!("{:?}", nix::errno::Errno::from_i32(errno))
}

// On Windows the event loop reports WSA/Win32 codes; substitute the
// equivalent POSIX names the way libuv does.
#[cfg(windows)]
fn errno_code(errno: i32) -> String {
	match errno {
		2 | 3 => "ENOENT",
		5 => "EACCES",
		10013 => "EACCES",
		10048 => "EADDRINUSE",
		10049 => "EADDRNOTAVAIL",
		10054 => "ECONNRESET",
		10060 => "ETIMEDOUT",
		10061 => "ECONNREFUSED",
		10065 => "EHOSTUNREACH",
		231 => "ECONNREFUSED",
		_ => "EUNKNOWN",
	}.to_string()
}

fn kind_code(kind: io::ErrorKind) -> &'static str {
	match kind {
		io::ErrorKind::NotFound => "ENOENT",
		io::ErrorKind::PermissionDenied => "EACCES",
		io::ErrorKind::ConnectionRefused => "ECONNREFUSED",
		io::ErrorKind::ConnectionReset => "ECONNRESET",
		io::ErrorKind::ConnectionAborted => "ECONNABORTED",
		io::ErrorKind::AddrInUse => "EADDRINUSE",
		io::ErrorKind::AddrNotAvailable => "EADDRNOTAVAIL",
		io::ErrorKind::BrokenPipe => "EPIPE",
		io::ErrorKind::TimedOut => "ETIMEDOUT",
		_ => "EUNKNOWN",
	}
}

impl SysError {
	pub(crate) fn new(syscall: &'static str, err: &io::Error) -> Self {
		let errno = err.raw_os_error().unwrap_or(0);
		let code = if errno != 0 {
			errno_code(errno)
		} else {
			kind_code(err.kind()).to_string()
		};
		Self {
			syscall,
			code,
			errno,
			message: err.to_string(),
			address: None,
			port: None,
		}
	}

	pub(crate) fn with_address<T: Into<String>>(mut self, address: T, port: Option<u16>) -> Self {
		self.address = Some(address.into());
		self.port = port;
		self
	}

	pub(crate) fn to_lua_table<'l>(&self, lua: &'l Lua) -> LuaResult<LuaTable<'l>> {
		let tbl = lua.create_table_with_capacity(0, 6)?;
		tbl.raw_set("syscall", self.syscall)?;
		tbl.raw_set("code", self.code.as_str())?;
		tbl.raw_set("errno", self.errno)?;
		tbl.raw_set("message", self.message.as_str())?;
		if let Some(addr) = &self.address {
			tbl.raw_set("address", addr.as_str())?;
		}
		if let Some(port) = self.port {
			tbl.raw_set("port", port)?;
		}
		Ok(tbl)
	}
}

impl fmt::Display for SysError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		write!(f, "{} {} ({}): {}", self.syscall, self.code, self.errno, self.message)?;
		match (&self.address, self.port) {
			(Some(addr), Some(port)) => write!(f, " [{}:{}]", addr, port),
			(Some(addr), None) => write!(f, " [{}]", addr),
			_ => Ok(()),
		}
	}
}

impl std::error::Error for SysError {}

impl From<SysError> for LuaError {
	fn from(other: SysError) -> Self {
		LuaError::ExternalError(Arc::new(other))
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn syserror_carries_syscall_code_and_errno() {
		let io_err = io::Error::from_raw_os_error(libc_enoent());
		let err = SysError::new("connect", &io_err).with_address("/nonexistent/path", None);
		assert_eq!(err.syscall, "connect");
		assert_eq!(err.code, "ENOENT");
		assert_eq!(err.errno, libc_enoent());
		let rendered = format!("{}", err);
		assert!(rendered.contains("connect"));
		assert!(rendered.contains("ENOENT"));
		assert!(rendered.contains("/nonexistent/path"));
	}

	#[test]
	fn syserror_falls_back_to_kind_without_errno() {
		let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "nope");
		let err = SysError::new("connect", &io_err).with_address("127.0.0.1", Some(1));
		assert_eq!(err.code, "ECONNREFUSED");
		assert_eq!(err.errno, 0);
		assert!(format!("{}", err).contains("127.0.0.1:1"));
	}

	#[cfg(unix)]
	fn libc_enoent() -> i32 {
		nix::errno::Errno::ENOENT as i32
	}

	#[cfg(windows)]
	fn libc_enoent() -> i32 {
		2
	}
}
