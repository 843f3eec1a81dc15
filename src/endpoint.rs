/*!
# Endpoint model

A socket is addressed by exactly one of: a TCP host and port, a Unix socket
path, an already-connected file descriptor, or (on Windows) a named pipe.
String payloads are copied out of the options table; the caller keeps
ownership of its originals.
*/
use mlua::prelude::*;

use std::path::PathBuf;

use crate::error::ArgError;


#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Endpoint {
	Tcp{
		host: String,
		port: u16,
	},
	Unix{
		path: PathBuf,
	},
	Fd{
		fd: i32,
	},
	Pipe{
		name: String,
	},
}

/// Valid pipe names look like `\\.\pipe\name` or `\\?\pipe\name` with a
/// non-empty, separator-free tail.
pub(crate) fn is_pipe_name(s: &str) -> bool {
	let tail = match s.strip_prefix(r"\\.\pipe\") {
		Some(t) => t,
		None => match s.strip_prefix(r"\\?\pipe\") {
			Some(t) => t,
			None => return false,
		},
	};
	!tail.is_empty() && !tail.contains('\\') && !tail.contains('/')
}

fn strip_unix_prefix(s: &str) -> &str {
	for prefix in &["file://", "unix://", "sock://"] {
		if let Some(rest) = s.strip_prefix(prefix) {
			return rest;
		}
	}
	s
}

pub(crate) fn validate_port(port: i64) -> Result<u16, ArgError> {
	if port < 0 || port > 65535 {
		return Err(ArgError::InvalidArguments(format!("port out of range: {}", port)));
	}
	Ok(port as u16)
}

/// Split an URL-ish host specification (`scheme://host:port/...`) into host
/// and embedded port. Plain hosts pass through unchanged.
fn split_host_url(host: &str) -> Result<(String, Option<i64>), ArgError> {
	let rest = match host.find("://") {
		Some(idx) => &host[idx + 3..],
		None => host,
	};
	let authority = match rest.find('/') {
		Some(idx) => &rest[..idx],
		None => rest,
	};
	if authority.is_empty() {
		return Err(ArgError::InvalidArguments("empty hostname".into()));
	}
	// IPv6 literals carry their own colons, bracketed.
	if let Some(stripped) = authority.strip_prefix('[') {
		let end = match stripped.find(']') {
			Some(idx) => idx,
			None => return Err(ArgError::InvalidArguments(format!("unterminated IPv6 literal: {}", host))),
		};
		let addr = &stripped[..end];
		let port = match stripped[end + 1..].strip_prefix(':') {
			Some(p) => Some(p.parse::<i64>().map_err(|_| {
				ArgError::InvalidArguments(format!("invalid port in {}", host))
			})?),
			None => None,
		};
		return Ok((addr.to_string(), port));
	}
	match authority.rfind(':') {
		Some(idx) => {
			let port = authority[idx + 1..].parse::<i64>().map_err(|_| {
				ArgError::InvalidArguments(format!("invalid port in {}", host))
			})?;
			Ok((authority[..idx].to_string(), Some(port)))
		},
		None => Ok((authority.to_string(), None)),
	}
}

/**
Read the endpoint out of an options table.

Recognised keys: `hostname`/`host` plus `port`, `unix`, `fd`. Exactly one
addressing mode may be used.
*/
pub(crate) fn from_options<'l>(options: &LuaTable<'l>) -> Result<Endpoint, ArgError> {
	let host = match options.get::<_, Option<String>>("hostname") {
		Ok(Some(v)) => Some(v),
		Ok(None) => match options.get::<_, Option<String>>("host") {
			Ok(v) => v,
			Err(_) => return Err(ArgError::InvalidArguments("host must be a string".into())),
		},
		Err(_) => return Err(ArgError::InvalidArguments("hostname must be a string".into())),
	};
	let unix = match options.get::<_, Option<String>>("unix") {
		Ok(v) => v,
		Err(_) => return Err(ArgError::InvalidArguments("unix must be a string".into())),
	};
	let fd = match options.get::<_, Option<i64>>("fd") {
		Ok(v) => v,
		Err(_) => return Err(ArgError::InvalidArguments("fd must be an integer".into())),
	};
	let port = match options.get::<_, Option<i64>>("port") {
		Ok(v) => v,
		Err(_) => return Err(ArgError::InvalidArguments("port must be an integer".into())),
	};

	let modes = host.is_some() as u8 + unix.is_some() as u8 + fd.is_some() as u8;
	if modes > 1 {
		return Err(ArgError::InvalidArguments("host, unix and fd are mutually exclusive".into()));
	}

	if let Some(fd) = fd {
		if fd < 0 {
			return Err(ArgError::InvalidArguments(format!("invalid file descriptor: {}", fd)));
		}
		return Ok(Endpoint::Fd{fd: fd as i32});
	}

	if let Some(unix) = unix {
		let path = strip_unix_prefix(&unix);
		if path.is_empty() {
			return Err(ArgError::InvalidArguments("empty unix socket path".into()));
		}
		return Ok(Endpoint::Unix{path: PathBuf::from(path)});
	}

	let host = match host {
		Some(v) => v,
		None => return Err(ArgError::InvalidArguments("one of host, unix or fd is required".into())),
	};
	if host.is_empty() {
		return Err(ArgError::InvalidArguments("empty hostname".into()));
	}

	if is_pipe_name(&host) {
		if cfg!(windows) {
			return Ok(Endpoint::Pipe{name: host});
		}
		return Err(ArgError::InvalidArguments("named pipes are only available on Windows".into()));
	}

	let (host, embedded_port) = split_host_url(&host)?;
	let port = match port.or(embedded_port) {
		Some(p) => validate_port(p)?,
		None => return Err(ArgError::InvalidArguments("port is required alongside a hostname".into())),
	};
	Ok(Endpoint::Tcp{host, port})
}


#[cfg(test)]
mod tests {
	use super::*;

	fn options<'l>(lua: &'l Lua, pairs: &[(&str, LuaValue<'l>)]) -> LuaTable<'l> {
		let tbl = lua.create_table().unwrap();
		for (k, v) in pairs {
			tbl.set(*k, v.clone()).unwrap();
		}
		tbl
	}

	fn s<'l>(lua: &'l Lua, v: &str) -> LuaValue<'l> {
		LuaValue::String(lua.create_string(v).unwrap())
	}

	#[test]
	fn tcp_host_and_port() {
		let lua = Lua::new();
		let tbl = options(&lua, &[("host", s(&lua, "127.0.0.1")), ("port", LuaValue::Integer(8080))]);
		assert_eq!(
			from_options(&tbl).unwrap(),
			Endpoint::Tcp{host: "127.0.0.1".into(), port: 8080}
		);
	}

	#[test]
	fn port_boundaries() {
		let lua = Lua::new();
		for port in [0i64, 65535] {
			let tbl = options(&lua, &[("host", s(&lua, "::1")), ("port", LuaValue::Integer(port))]);
			assert!(from_options(&tbl).is_ok(), "port {} should be accepted", port);
		}
		for port in [-1i64, 65536] {
			let tbl = options(&lua, &[("host", s(&lua, "::1")), ("port", LuaValue::Integer(port))]);
			assert!(from_options(&tbl).is_err(), "port {} should be rejected", port);
		}
	}

	#[test]
	fn url_port_extraction() {
		let lua = Lua::new();
		let tbl = options(&lua, &[("host", s(&lua, "https://example.com:8443/some/path"))]);
		assert_eq!(
			from_options(&tbl).unwrap(),
			Endpoint::Tcp{host: "example.com".into(), port: 8443}
		);
		let tbl = options(&lua, &[("host", s(&lua, "wss://[::1]:9443"))]);
		assert_eq!(
			from_options(&tbl).unwrap(),
			Endpoint::Tcp{host: "::1".into(), port: 9443}
		);
	}

	#[test]
	fn explicit_port_wins_when_url_has_none() {
		let lua = Lua::new();
		let tbl = options(&lua, &[("host", s(&lua, "http://example.com")), ("port", LuaValue::Integer(81))]);
		assert_eq!(
			from_options(&tbl).unwrap(),
			Endpoint::Tcp{host: "example.com".into(), port: 81}
		);
	}

	#[test]
	fn unix_prefixes_are_stripped() {
		let lua = Lua::new();
		for spec in ["unix:///tmp/x.sock", "file:///tmp/x.sock", "sock:///tmp/x.sock", "/tmp/x.sock"] {
			let tbl = options(&lua, &[("unix", s(&lua, spec))]);
			assert_eq!(
				from_options(&tbl).unwrap(),
				Endpoint::Unix{path: PathBuf::from("/tmp/x.sock")},
				"spec {}", spec
			);
		}
	}

	#[test]
	fn empty_hostname_rejected() {
		let lua = Lua::new();
		let tbl = options(&lua, &[("host", s(&lua, "")), ("port", LuaValue::Integer(1))]);
		assert!(from_options(&tbl).is_err());
		let tbl = options(&lua, &[]);
		assert!(from_options(&tbl).is_err());
	}

	#[test]
	fn addressing_modes_are_mutually_exclusive() {
		let lua = Lua::new();
		let tbl = options(&lua, &[
			("host", s(&lua, "127.0.0.1")),
			("port", LuaValue::Integer(1)),
			("unix", s(&lua, "/tmp/x.sock")),
		]);
		assert!(from_options(&tbl).is_err());
		let tbl = options(&lua, &[("fd", LuaValue::Integer(3)), ("unix", s(&lua, "/tmp/x.sock"))]);
		assert!(from_options(&tbl).is_err());
	}

	#[test]
	fn pipe_names() {
		assert!(is_pipe_name(r"\\.\pipe\rsocket-test"));
		assert!(is_pipe_name(r"\\?\pipe\rsocket-test"));
		assert!(!is_pipe_name(r"\\.\pipe\"));
		assert!(!is_pipe_name(r"\\.\pipe\a\b"));
		assert!(!is_pipe_name("/tmp/pipe"));

		#[cfg(not(windows))]
		{
			let lua = Lua::new();
			let tbl = options(&lua, &[("host", s(&lua, r"\\.\pipe\rsocket-test"))]);
			assert!(from_options(&tbl).is_err());
		}
	}
}
