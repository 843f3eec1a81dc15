use mlua::prelude::*;

use std::convert::TryFrom;
use std::sync::Arc;

#[cfg(unix)]
use std::os::unix::io::{FromRawFd, RawFd};

#[cfg(unix)]
use tokio::net::TcpStream;

#[cfg(unix)]
use nix::{
	fcntl::FcntlArg,
	fcntl::fcntl,
};

use tokio_rustls::rustls;

use crate::config::CONFIG;
use crate::dispatch;
use crate::endpoint;
use crate::endpoint::Endpoint;
use crate::error::ArgError;
use crate::handlers::{BinaryType, Event, HandlerSet};
use crate::tls;
use crate::with_runtime_lua;

use super::connect::{ConnectTarget, ConnectWorker};
use super::handle::{AddrStr, Kind, SocketHandle};
use super::msg::SocketOption;
use super::state::{PreTlsConfig, SocketState, StateError, TlsPhase};
use super::worker::{FdStream, Shared, StreamWorker};

use crate::core::Spawn;


impl From<StateError> for LuaError {
	fn from(other: StateError) -> Self {
		LuaError::ExternalError(Arc::new(other))
	}
}

impl SocketOption {
	pub(crate) fn from_lua_args<'l>(_lua: &'l Lua, option: String, _value: LuaValue) -> Result<SocketOption, String> {
		match option.as_str() {
			"keepalive" => Ok(SocketOption::KeepAlive(true)),
			_ => Err(format!("socket option not supported: {}", option)),
		}
	}
}

pub(crate) fn parse_binary_type<'l>(options: &LuaTable<'l>) -> LuaResult<BinaryType> {
	match options.get::<_, Option<String>>("binaryType")? {
		Some(s) => Ok(BinaryType::from_str(&s)?),
		None => Ok(BinaryType::default()),
	}
}

/// Read the `tls` option: absent/false, `true` (default client config) or a
/// config handle created by `new_tls_config`.
pub(crate) fn tls_option<'l>(options: &LuaTable<'l>) -> LuaResult<Option<tls::TlsConfig>> {
	match options.get::<_, LuaValue>("tls")? {
		LuaValue::Nil | LuaValue::Boolean(false) => Ok(None),
		LuaValue::Boolean(true) => Ok(Some(tls::TlsConfig::Client(tls::default_client_config()))),
		LuaValue::UserData(ud) => {
			let handle = ud.borrow::<tls::TlsConfigHandle>()?;
			Ok(Some(handle.as_ref().clone()))
		},
		other => Err(ArgError::InvalidArguments(format!(
			"tls must be true or a TLS config, got {}",
			other.type_name()
		)).into()),
	}
}

fn remote_addr(ep: &Endpoint) -> AddrStr {
	match ep {
		Endpoint::Tcp{host, port} => AddrStr::InetAny{addr: host.clone(), port: *port},
		Endpoint::Unix{path} => AddrStr::Unix{path: path.to_string_lossy().into()},
		Endpoint::Pipe{name} => AddrStr::Pipe{name: name.clone()},
		Endpoint::Fd{..} => AddrStr::Unspecified,
	}
}

/**
Create an outbound socket.

The options table carries the endpoint, the `socket` callback record, and
optionally `tls`, `servername`, `binaryType`, `allowHalfOpen`, `data` and a
`promise` record with `resolve`/`reject` callables.
*/
pub(crate) fn connect<'l>(lua: &'l Lua, options: LuaTable<'l>) -> LuaResult<LuaAnyUserData<'l>> {
	let ep = endpoint::from_options(&options).map_err(LuaError::from)?;
	let callbacks = match options.get::<_, Option<LuaTable>>("socket")? {
		Some(v) => v,
		None => return Err(ArgError::InvalidArguments("socket callback record is required".into()).into()),
	};
	let binary_type = parse_binary_type(&options)?;
	let allow_half_open = options.get::<_, Option<bool>>("allowHalfOpen")?.unwrap_or(false);
	let promise = options.get::<_, Option<LuaTable>>("promise")?;
	let default_data = options.get::<_, LuaValue>("data")?;

	let client_tls = match tls_option(&options)? {
		None => None,
		Some(tls::TlsConfig::Client(parts)) => Some(parts),
		Some(tls::TlsConfig::Server(..)) => {
			return Err(ArgError::InvalidArguments("connect requires a client-mode TLS config".into()).into())
		},
	};
	let servername = options.get::<_, Option<String>>("servername")?;
	let tls_pair = match client_tls {
		Some(parts) => {
			let text = match servername.or_else(|| match &ep {
				Endpoint::Tcp{host, ..} => Some(host.clone()),
				_ => None,
			}) {
				Some(t) => t,
				None => return Err(ArgError::InvalidArguments("servername is required for TLS".into()).into()),
			};
			let name = rustls::ServerName::try_from(text.as_str()).map_err(|e| {
				LuaError::from(ArgError::InvalidArguments(format!("servername is not usable for TLS: {}", e)))
			})?;
			Some((name, text, parts))
		},
		None => None,
	};

	#[cfg(unix)]
	if let Endpoint::Fd{fd} = ep {
		let pre = match &tls_pair {
			Some((name, _, parts)) => PreTlsConfig::Client(name.clone(), parts.clone()),
			None => PreTlsConfig::None,
		};
		let text = tls_pair.as_ref().map(|(_, text, _)| text.clone());
		return wrap_established(lua, fd, callbacks, binary_type, allow_half_open, promise, default_data, pre, text);
	}
	#[cfg(not(unix))]
	if let Endpoint::Fd{..} = ep {
		return Err(ArgError::InvalidArguments("fd sockets are not available on this platform".into()).into());
	}

	let (stream_cfg, connect_cfg) = {
		let config = CONFIG.read().unwrap();
		(config.stream, config.client)
	};

	let handlers = HandlerSet::from_options(lua, callbacks, binary_type, false, promise, Some(default_data.clone()))?;
	let shared = Shared::new(stream_cfg.write_hwm, false);
	let remote = remote_addr(&ep);
	let pre = match &tls_pair {
		Some((name, _, parts)) => PreTlsConfig::Client(name.clone(), parts.clone()),
		None => PreTlsConfig::None,
	};
	let (mut handle, rx) = SocketHandle::new(
		SocketState::Connecting(pre),
		Kind::Client,
		AddrStr::Unspecified,
		remote,
		shared.clone(),
		handlers,
	);
	handle.allow_half_open = allow_half_open;
	handle.tls_pending = tls_pair.is_some();
	handle.servername = tls_pair.as_ref().map(|(_, text, _)| text.clone());
	handle.sessions = tls_pair.as_ref().map(|(_, _, parts)| parts.sessions.clone());

	let (ud, key) = SocketHandle::create(lua, handle, default_data)?;

	let target = match ep {
		Endpoint::Tcp{host, port} => ConnectTarget::Tcp{host, port},
		#[cfg(unix)]
		Endpoint::Unix{path} => ConnectTarget::Unix{path},
		#[cfg(not(unix))]
		Endpoint::Unix{..} => {
			return Err(ArgError::InvalidArguments("unix sockets are not available on this platform".into()).into())
		},
		#[cfg(windows)]
		Endpoint::Pipe{name} => ConnectTarget::Pipe{name},
		#[cfg(not(windows))]
		Endpoint::Pipe{..} => {
			return Err(ArgError::InvalidArguments("named pipes are only available on Windows".into()).into())
		},
		Endpoint::Fd{..} => unreachable!("fd endpoints are wrapped directly"),
	};
	let tls_arg = tls_pair.map(|(name, _, parts)| (name, parts));

	with_runtime_lua!{
		ConnectWorker::new(rx, target, tls_arg, connect_cfg, stream_cfg, shared, key).spawn()
	}
	Ok(ud)
}

/**
Adopt an already-connected descriptor as an open socket.

The descriptor is duplicated with CLOEXEC and switched to non-blocking
before it is handed to the runtime; the caller keeps its original.
*/
#[cfg(unix)]
pub(crate) fn wrapfd<'l>(
		lua: &'l Lua,
		(fd, options): (RawFd, LuaTable<'l>),
		) -> LuaResult<LuaAnyUserData<'l>>
{
	let callbacks = match options.get::<_, Option<LuaTable>>("socket")? {
		Some(v) => v,
		None => return Err(ArgError::InvalidArguments("socket callback record is required".into()).into()),
	};
	let binary_type = parse_binary_type(&options)?;
	let allow_half_open = options.get::<_, Option<bool>>("allowHalfOpen")?.unwrap_or(false);
	let promise = options.get::<_, Option<LuaTable>>("promise")?;
	let default_data = options.get::<_, LuaValue>("data")?;

	let (pre, servername) = match tls_option(&options)? {
		None => (PreTlsConfig::None, None),
		Some(tls::TlsConfig::Server(parts)) => (PreTlsConfig::Server(parts), None),
		Some(tls::TlsConfig::Client(parts)) => {
			let text = match options.get::<_, Option<String>>("servername")? {
				Some(t) => t,
				None => return Err(ArgError::InvalidArguments("servername is required for TLS".into()).into()),
			};
			let name = rustls::ServerName::try_from(text.as_str()).map_err(|e| {
				LuaError::from(ArgError::InvalidArguments(format!("servername is not usable for TLS: {}", e)))
			})?;
			(PreTlsConfig::Client(name, parts), Some(text))
		},
	};

	wrap_established(lua, fd, callbacks, binary_type, allow_half_open, promise, default_data, pre, servername)
}

#[cfg(unix)]
fn wrap_established<'l>(
	lua: &'l Lua,
	fd: RawFd,
	callbacks: LuaTable<'l>,
	binary_type: BinaryType,
	allow_half_open: bool,
	promise: Option<LuaTable<'l>>,
	default_data: LuaValue<'l>,
	pre: PreTlsConfig,
	servername: Option<String>,
) -> LuaResult<LuaAnyUserData<'l>> {
	let fd = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0)).map_err(|e| {
		LuaError::from(ArgError::InvalidArguments(format!("cannot adopt file descriptor: {}", e)))
	})?;
	// this is probably the worst one could do... let's hope the syscalls will quickly let this fail
	let sock = unsafe { socket2::Socket::from_raw_fd(fd) };
	sock.set_nonblocking(true)?;
	let sock: std::net::TcpStream = sock.into();

	let stream_cfg = CONFIG.read().unwrap().stream;
	let local = sock.local_addr().map(AddrStr::from).unwrap_or(AddrStr::Unspecified);
	let remote = sock.peer_addr().map(AddrStr::from).unwrap_or(AddrStr::Unspecified);

	let sessions = match &pre {
		PreTlsConfig::Client(_, parts) => Some(parts.sessions.clone()),
		_ => None,
	};

	let handlers = HandlerSet::from_options(lua, callbacks, binary_type, false, promise, Some(default_data.clone()))?;
	let shared = Shared::new(stream_cfg.write_hwm, false);
	let (mut handle, rx) = SocketHandle::new(
		SocketState::Open(TlsPhase::Plain(pre)),
		Kind::Client,
		local,
		remote,
		shared.clone(),
		handlers.clone(),
	);
	handle.allow_half_open = allow_half_open;
	handle.sessions = sessions;
	handle.servername = servername;
	handle.open_fired = true;
	handle.promise_settled = true;

	let (ud, key) = SocketHandle::create(lua, handle, default_data)?;

	with_runtime_lua!{
		let sock = TcpStream::from_std(sock)?;
		StreamWorker::new(rx, sock.into(), stream_cfg, shared, key).spawn()
	}

	// the transport is already connected, so the open callback fires on the
	// spot and a pending promise resolves with the handle
	let _ = handlers.resolve_promise(lua, LuaValue::UserData(ud.clone()));
	dispatch::call_handler(lua, &handlers, &ud, Event::Open, (ud.clone(),));
	Ok(ud)
}

#[cfg(not(unix))]
pub(crate) fn wrapfd<'l>(
		_lua: &'l Lua,
		(_fd, _options): (i32, LuaTable<'l>),
		) -> LuaResult<LuaAnyUserData<'l>>
{
	Err(ArgError::InvalidArguments("fd sockets are not available on this platform".into()).into())
}
