/*!
# In-place TLS upgrade

`upgradetls(socket, {socket = handlers, tls = config, ...})` layers TLS over
an already-open plaintext engine and returns the two logical faces of the
same transport: the raw view (carrying the originating engine's callbacks)
and the TLS view (carrying the supplied ones). The originating engine is
detached; post-upgrade events route to the TLS face and a close detaches
both faces atomically.
*/
use mlua::prelude::*;

use std::convert::TryFrom;

use tokio_rustls::rustls;

use crate::error::ArgError;
use crate::handlers::HandlerSet;
use crate::stream;
use crate::stream::{
	ControlMessage,
	SocketHandle,
	SocketState,
	PreTlsConfig,
	TlsPhase,
	WrapMode,
};
use crate::tls;


pub(crate) fn upgrade_tls<'l>(
	lua: &'l Lua,
	(socket, options): (LuaAnyUserData<'l>, LuaTable<'l>),
) -> LuaResult<LuaTable<'l>> {
	let callbacks = match options.get::<_, Option<LuaTable>>("socket")? {
		Some(v) => v,
		None => return Err(ArgError::InvalidArguments("socket callback record is required".into()).into()),
	};
	let tls_cfg = match stream::tls_option(&options)? {
		Some(cfg) => cfg,
		None => return Err(ArgError::InvalidArguments("tls config is required".into()).into()),
	};
	let default_data = options.get::<_, LuaValue>("data")?;
	let servername = options.get::<_, Option<String>>("servername")?;

	// validate the engine and derive the handshake instruction
	let (start, tx, shared, local, remote, kind, orig_handlers, sni_text) = {
		let mut h = socket.borrow_mut::<SocketHandle>()?;
		if h.wrap != WrapMode::None {
			return Err(ArgError::InvalidState("socket is already part of a wrapped pair").into());
		}
		if h.local.is_pipe() || h.remote.is_pipe() {
			return Err(ArgError::InvalidState("named pipes cannot be upgraded in place").into());
		}
		if h.detached || h.torn_down || !h.state.is_open() {
			return Err(ArgError::InvalidState("socket is not open").into());
		}
		if h.state.is_tls() {
			return Err(ArgError::InvalidState("socket already carries TLS").into());
		}
		let sni_text = servername.or_else(|| h.servername.clone());
		let sni = match &sni_text {
			Some(text) => Some(rustls::ServerName::try_from(text.as_str()).map_err(|e| {
				LuaError::from(ArgError::InvalidArguments(format!("servername is not usable for TLS: {}", e)))
			})?),
			None => None,
		};
		let start = h.state.start_tls(Some(&tls_cfg), sni)?;
		(
			start,
			h.tx.clone(),
			h.shared.clone(),
			h.local.clone(),
			h.remote.clone(),
			h.kind,
			h.handlers.clone(),
			sni_text,
		)
	};

	let binary_type = match options.get::<_, Option<String>>("binaryType")? {
		Some(s) => crate::handlers::BinaryType::from_str(&s)?,
		None => orig_handlers.binary_type,
	};
	let tls_handlers = HandlerSet::from_options(
		lua,
		callbacks,
		binary_type,
		orig_handlers.is_server,
		None,
		Some(default_data.clone()),
	)?;

	let sessions = match &tls_cfg {
		tls::TlsConfig::Client(parts) => Some(parts.sessions.clone()),
		tls::TlsConfig::Server(..) => None,
	};

	// the TLS face carries the loop ref for the pair
	let mut tls_face = SocketHandle::attached(
		tx.clone(),
		SocketState::Open(TlsPhase::Handshaking),
		kind,
		local.clone(),
		remote.clone(),
		shared.clone(),
		tls_handlers,
		true,
	);
	tls_face.wrap = WrapMode::TlsFace;
	tls_face.sessions = sessions;
	tls_face.servername = sni_text;
	let (tls_ud, tls_key) = SocketHandle::create(lua, tls_face, default_data)?;

	// the raw view clones the originating engine's callbacks; it sees no
	// further bytes and refuses writes
	let mut raw_face = SocketHandle::attached(
		tx.clone(),
		SocketState::Open(TlsPhase::Plain(PreTlsConfig::None)),
		kind,
		local,
		remote,
		shared.clone(),
		orig_handlers,
		false,
	);
	raw_face.wrap = WrapMode::TcpFace;
	raw_face.detached = true;
	// the raw transport was already open; only the TLS face waits for a
	// handshake before its open callback
	raw_face.open_fired = true;
	let raw_data = socket.get_user_value::<LuaTable>()?.raw_get::<_, LuaValue>("data")?;
	let (raw_ud, raw_key) = SocketHandle::create(lua, raw_face, raw_data)?;

	{
		let mut h = tls_ud.borrow_mut::<SocketHandle>()?;
		h.sibling = Some(raw_key);
	}
	{
		let mut h = raw_ud.borrow_mut::<SocketHandle>()?;
		h.sibling = Some(tls_key.clone());
	}

	// detach the originating engine: its loop ref drops, its handler
	// reference is released, its writes return -1
	{
		let mut h = socket.borrow_mut::<SocketHandle>()?;
		h.detach_for_upgrade();
	}

	// the handshake starts only after the pair link is stored; the worker
	// swaps its dispatch target before touching the transport
	if tx.send(ControlMessage::StartTls(start, Some(tls_key))).is_err() {
		let _ = tls_ud.borrow_mut::<SocketHandle>()?.teardown();
		let _ = raw_ud.borrow_mut::<SocketHandle>()?.teardown();
		return Err(ArgError::InvalidState("socket transport is already gone").into());
	}

	let result = lua.create_table_with_capacity(2, 0)?;
	result.raw_set(1, raw_ud)?;
	result.raw_set(2, tls_ud)?;
	Ok(result)
}
