/*!
# Event dispatch into script callbacks

The socket workers report everything through the main channel; this module
drains it on the Lua thread and invokes the registered callbacks. All
ordering guarantees live here: `open` precedes `data`, `end` precedes
`close`, `close` is final and fires at most once.
*/
use mlua::prelude::*;

use std::sync::atomic::Ordering;

use tokio::select;

use crate::config::CONFIG;
use crate::core;
use crate::core::{
	get_runtime,
	GC_FLAG,
	LuaRegistryHandle,
	MAIN_CHANNEL,
	Message,
	RUNTIME,
	Spawn,
	WAKEUP,
};
use crate::handlers::{Event, HandlerSet};
use crate::listener::ListenerHandle;
use crate::stream::{
	AddrStr,
	ControlMessage,
	FdStream,
	Kind,
	PreTlsConfig,
	Shared,
	SocketHandle,
	SocketState,
	StreamWorker,
	TlsPhase,
};
use crate::tls;
use crate::with_runtime_lua;


/// Invoke one event callback with error routing: failures go to the
/// `error` handler, or are reported uncaught.
pub(crate) fn call_handler<'l, A: ToLuaMulti<'l>>(
	lua: &'l Lua,
	handlers: &HandlerSet,
	this: &LuaAnyUserData<'l>,
	ev: Event,
	args: A,
) {
	let func = match handlers.get_function(lua, ev) {
		Ok(Some(f)) => f,
		Ok(None) => return,
		Err(e) => {
			log::error!("failed to look up {:?} handler: {}", ev.name(), e);
			return;
		},
	};
	let _guard = handlers.enter();
	if let Err(e) = func.call::<_, ()>(args) {
		handlers.call_error_handler(lua, LuaValue::UserData(this.clone()), &format!("{}", e));
	}
}

fn with_socket<R, F: FnOnce(&mut SocketHandle) -> R>(ud: &LuaAnyUserData, f: F) -> LuaResult<R> {
	let mut h = ud.borrow_mut::<SocketHandle>()?;
	Ok(f(&mut h))
}

fn resolve<'l>(lua: &'l Lua, handle: &LuaRegistryHandle) -> LuaResult<LuaAnyUserData<'l>> {
	lua.registry_value::<LuaAnyUserData>(&**handle)
}

/// Terminal teardown of one engine handle: release accounting, fire
/// `close` (unless finalizing or never opened), settle a pending promise.
fn close_engine<'l>(lua: &'l Lua, ud: &LuaAnyUserData<'l>, error: Option<&str>) -> LuaResult<()> {
	let (handlers, fire_close, reject, sibling) = with_socket(ud, |h| {
		let was_open = h.open_fired;
		let reject = !h.promise_settled;
		h.promise_settled = true;
		let finalizing = h.shared.finalizing.load(Ordering::SeqCst);
		let did = h.teardown();
		(
			h.handlers.clone(),
			did && was_open && !finalizing,
			did && reject,
			h.sibling.take(),
		)
	})?;
	if reject {
		let err = lua.create_table_with_capacity(0, 2)?;
		err.raw_set("message", error.unwrap_or("connection closed"))?;
		err.raw_set("syscall", "connect")?;
		if let Err(e) = handlers.reject_promise(lua, LuaValue::Table(err)) {
			log::error!("failed to reject connect promise: {}", e);
		}
	}
	if fire_close {
		match error {
			Some(text) => call_handler(lua, &handlers, ud, Event::Close, (ud.clone(), text.to_string())),
			None => call_handler(lua, &handlers, ud, Event::Close, (ud.clone(),)),
		}
	}
	// a wrap pair detaches both faces atomically
	if let Some(sibling) = sibling {
		let sib = resolve(lua, &sibling)?;
		{
			let mut h = sib.borrow_mut::<SocketHandle>()?;
			h.sibling = None;
		}
		close_engine(lua, &sib, error)?;
	}
	Ok(())
}

fn accept_engine<'l>(
	lua: &'l Lua,
	listener: &LuaAnyUserData<'l>,
	stream: FdStream,
	remote: AddrStr,
	info: Option<tls::Info>,
) -> LuaResult<()> {
	let (handlers, allow_half_open, local) = {
		let l = listener.borrow::<ListenerHandle>()?;
		(l.current_handlers(), l.allow_half_open, l.local.clone())
	};
	let stream_cfg = CONFIG.read().unwrap().stream;
	let is_tls = info.is_some();
	let shared = Shared::new(stream_cfg.write_hwm, is_tls);

	let (authorized, verify_error, fire_handshake) = match &info {
		Some(info) => (
			info.verify.authorized(),
			info.verify.error_text(),
			handlers.has(Event::Handshake),
		),
		None => (false, None, false),
	};
	let state = match info {
		Some(info) => SocketState::Open(TlsPhase::Established(Box::new(info))),
		None => SocketState::Open(TlsPhase::Plain(PreTlsConfig::None)),
	};

	let (mut h, rx) = SocketHandle::new(state, Kind::Server, local, remote, shared.clone(), handlers.clone());
	h.allow_half_open = allow_half_open;
	h.open_fired = true;
	h.promise_settled = true;
	let conn_tx = h.tx.clone();

	let data = handlers.default_data(lua)?;
	let (ud, key) = SocketHandle::create(lua, h, data)?;
	{
		let l = listener.borrow::<ListenerHandle>()?;
		l.register_conn(conn_tx);
	}

	with_runtime_lua!{
		StreamWorker::new(rx, stream, stream_cfg, shared, key).spawn()
	}

	call_handler(lua, &handlers, &ud, Event::Open, (ud.clone(),));
	if fire_handshake {
		call_handler(lua, &handlers, &ud, Event::Handshake, (ud.clone(), authorized, verify_error));
	}
	Ok(())
}

fn duplex_callable<'l>(ud: &LuaAnyUserData<'l>, name: &str) -> LuaResult<Option<(LuaTable<'l>, LuaFunction<'l>)>> {
	let data = ud.get_user_value::<LuaTable>()?;
	let duplex = match data.raw_get::<_, Option<LuaTable>>("_duplex")? {
		Some(v) => v,
		None => return Ok(None),
	};
	match duplex.raw_get::<_, Option<LuaFunction>>(name)? {
		Some(f) => Ok(Some((duplex, f))),
		None => Ok(None),
	}
}

fn proc_message<'l>(lua: &'l Lua, msg: Message) -> LuaResult<()> {
	match msg {
		Message::Connected{handle, local} => {
			let ud = resolve(lua, &handle)?;
			let (handlers, fire_open, resolve_promise) = with_socket(&ud, |h| {
				if let Some(local) = local {
					h.local = local;
				}
				let _ = h.state.connected();
				let has_handshake = h.handlers.has(Event::Handshake);
				let fire_open = !h.open_fired && (!h.tls_pending || has_handshake);
				if fire_open {
					h.open_fired = true;
				}
				let settle = !h.promise_settled && (!h.tls_pending || has_handshake);
				if settle {
					h.promise_settled = true;
				}
				(h.handlers.clone(), fire_open, settle)
			})?;
			if fire_open {
				call_handler(lua, &handlers, &ud, Event::Open, (ud.clone(),));
			}
			if resolve_promise {
				if let Err(e) = handlers.resolve_promise(lua, LuaValue::UserData(ud.clone())) {
					log::error!("failed to resolve connect promise: {}", e);
				}
			}
		},
		Message::ConnectFailed{handle, error} => {
			let ud = resolve(lua, &handle)?;
			let (handlers, proceed) = with_socket(&ud, |h| {
				let reject = !h.promise_settled;
				h.promise_settled = true;
				(h.handlers.clone(), h.teardown() && reject)
			})?;
			let err_tbl = error.to_lua_table(lua)?;
			call_handler(lua, &handlers, &ud, Event::ConnectError, (ud.clone(), err_tbl.clone()));
			// rejected-as-handled: the promise settles even when the
			// callback already consumed the error
			if proceed {
				if let Err(e) = handlers.reject_promise(lua, LuaValue::Table(err_tbl)) {
					log::error!("failed to reject connect promise: {}", e);
				}
			}
		},
		Message::TlsEstablished{handle, info} => {
			let ud = resolve(lua, &handle)?;
			let authorized = info.verify.authorized();
			let verify_error = info.verify.error_text();
			let (handlers, fire_open, fire_handshake, resolve_promise) = with_socket(&ud, |h| {
				let _ = h.state.tls_established(info);
				// the open callback fires at most once; a repeated
				// handshake must not re-fire it
				let fire_open = !h.open_fired;
				if fire_open {
					h.open_fired = true;
				}
				let settle = !h.promise_settled;
				if settle {
					h.promise_settled = true;
				}
				(h.handlers.clone(), fire_open, h.handlers.has(Event::Handshake), settle)
			})?;
			if fire_open {
				call_handler(lua, &handlers, &ud, Event::Open, (ud.clone(),));
			}
			if fire_handshake {
				call_handler(lua, &handlers, &ud, Event::Handshake, (ud.clone(), authorized, verify_error));
			}
			if resolve_promise {
				if let Err(e) = handlers.resolve_promise(lua, LuaValue::UserData(ud.clone())) {
					log::error!("failed to resolve connect promise: {}", e);
				}
			}
		},
		Message::TlsFailed{handle, error} => {
			let ud = resolve(lua, &handle)?;
			let handlers = with_socket(&ud, |h| h.handlers.clone())?;
			handlers.call_error_handler(lua, LuaValue::UserData(ud.clone()), &error);
			close_engine(lua, &ud, Some(&error))?;
		},
		Message::Incoming{handle, data} => {
			let ud = resolve(lua, &handle)?;
			let (handlers, hook_took) = {
				let mut h = ud.borrow_mut::<SocketHandle>()?;
				let handlers = h.handlers.clone();
				match h.hook.as_mut() {
					Some(hook) => {
						// a native consumer takes the byte stream instead
						// of the data callback
						if let Err(e) = hook(lua, &data) {
							log::error!("native stream hook failed: {}", e);
						}
						(handlers, true)
					},
					None => (handlers, false),
				}
			};
			if !hook_took {
				let payload = handlers.binary_type.materialize(lua, data)?;
				call_handler(lua, &handlers, &ud, Event::Data, (ud.clone(), payload));
			}
		},
		Message::Drained{handle} => {
			let ud = resolve(lua, &handle)?;
			let handlers = with_socket(&ud, |h| h.handlers.clone())?;
			call_handler(lua, &handlers, &ud, Event::Drain, (ud.clone(),));
		},
		Message::ReadClosed{handle} => {
			let ud = resolve(lua, &handle)?;
			let (handlers, fire_end, auto_close) = with_socket(&ud, |h| {
				let newly = h.state.remote_closed().unwrap_or(false);
				let has_end = h.handlers.has(Event::End);
				(
					h.handlers.clone(),
					newly && has_end,
					newly && (!has_end || !h.allow_half_open),
				)
			})?;
			if fire_end {
				call_handler(lua, &handlers, &ud, Event::End, (ud.clone(),));
			}
			if auto_close {
				let h = ud.borrow::<SocketHandle>()?;
				let _ = h.tx.send(ControlMessage::Close);
			}
		},
		Message::IdleTimeout{handle, keepalive} => {
			let ud = resolve(lua, &handle)?;
			let handlers = with_socket(&ud, |h| h.handlers.clone())?;
			call_handler(lua, &handlers, &ud, Event::Timeout, (ud.clone(),));
			// inactivity never closes by itself; the script decides
			let _ = keepalive.send(true);
		},
		Message::Disconnect{handle, error} => {
			let ud = resolve(lua, &handle)?;
			let error = error.map(|e| format!("{}", e));
			close_engine(lua, &ud, error.as_deref())?;
		},
		Message::Accepted{handle, stream, remote} => {
			let listener = resolve(lua, &handle)?;
			accept_engine(lua, &listener, stream, remote, None)?;
		},
		Message::AcceptedTls{handle, stream, remote, info} => {
			let listener = resolve(lua, &handle)?;
			accept_engine(lua, &listener, stream, remote, Some(info))?;
		},
		Message::DuplexWrite{handle, data} => {
			let ud = resolve(lua, &handle)?;
			if let Some((duplex, write)) = duplex_callable(&ud, "write")? {
				if let Err(e) = write.call::<_, ()>((duplex, lua.create_string(&data)?)) {
					let handlers = with_socket(&ud, |h| h.handlers.clone())?;
					handlers.call_error_handler(lua, LuaValue::UserData(ud.clone()), &format!("{}", e));
				}
			}
		},
		Message::DuplexClose{handle} => {
			let ud = resolve(lua, &handle)?;
			if let Some((duplex, close)) = duplex_callable(&ud, "close")? {
				if let Err(e) = close.call::<_, ()>(duplex) {
					log::error!("duplex close callback failed: {}", e);
				}
			}
		},
	};
	Ok(())
}

/**
Run the dispatch loop until nothing holds a keep-alive ref (or shutdown is
requested). Scripts create their sockets first and then enter the loop.
*/
pub(crate) fn mainloop<'l>(lua: &'l Lua, _: ()) -> LuaResult<()> {
	let ropt = RUNTIME.read().unwrap();
	let r = get_runtime(&ropt)?;
	let mut rx = MAIN_CHANNEL.lock_rx_lua()?;
	let _guard = r.enter();
	r.block_on(async move {
		loop {
			if core::shutdown_requested() || core::keepalive_count() == 0 {
				break;
			}
			select! {
				msg = rx.recv() => match msg {
					Some(msg) => {
						match proc_message(lua, msg) {
							Ok(_) => (),
							Err(e) => {
								log::error!("failed to process event loop message: {}", e);
							},
						}
					},
					None => break,
				},
				_ = WAKEUP.notified() => (),
			}
			if GC_FLAG.swap(false, Ordering::SeqCst) {
				lua.expire_registry_values();
			}
		}
		lua.expire_registry_values();
		Ok(())
	})
}

pub(crate) fn shutdown<'l>(_lua: &'l Lua, _: ()) -> LuaResult<()> {
	core::request_shutdown();
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	use std::cell::RefCell;
	use std::rc::Rc;

	use bytes::Bytes;

	use crate::handlers::BinaryType;
	use crate::stream::{Kind, PreTlsConfig, SocketHandle, SocketState, Shared, TlsPhase, AddrStr};

	fn make_socket<'l>(lua: &'l Lua) -> (LuaAnyUserData<'l>, LuaRegistryHandle) {
		let callbacks = lua.create_table().unwrap();
		callbacks.set("data", lua.create_function(|lua, (_this, chunk): (LuaValue, LuaString)| {
			lua.globals().set("script_saw", chunk)?;
			Ok(())
		}).unwrap()).unwrap();
		let handlers = HandlerSet::from_options(lua, callbacks, BinaryType::ArrayBuffer, false, None, None).unwrap();
		let shared = Shared::new(1024, false);
		let (mut handle, _rx) = SocketHandle::new(
			SocketState::Open(TlsPhase::Plain(PreTlsConfig::None)),
			Kind::Client,
			AddrStr::Unspecified,
			AddrStr::Unspecified,
			shared,
			handlers,
		);
		handle.open_fired = true;
		SocketHandle::create(lua, handle, LuaValue::Nil).unwrap()
	}

	#[test]
	fn native_hook_consumes_the_byte_stream() {
		let lua = Lua::new();
		let (ud, key) = make_socket(&lua);
		let seen = Rc::new(RefCell::new(Vec::new()));
		{
			let seen = seen.clone();
			let mut h = ud.borrow_mut::<SocketHandle>().unwrap();
			h.hook = Some(Box::new(move |_, data| {
				seen.borrow_mut().extend_from_slice(data);
				Ok(())
			}));
		}
		proc_message(&lua, Message::Incoming{
			handle: key.clone(),
			data: Bytes::from_static(b"raw bytes"),
		}).unwrap();
		assert_eq!(&seen.borrow()[..], b"raw bytes");
		// the script callback was bypassed
		assert!(lua.globals().get::<_, Option<LuaString>>("script_saw").unwrap().is_none());

		// without the hook the data callback receives the chunk
		{
			let mut h = ud.borrow_mut::<SocketHandle>().unwrap();
			h.hook = None;
		}
		proc_message(&lua, Message::Incoming{
			handle: key,
			data: Bytes::from_static(b"for the script"),
		}).unwrap();
		let chunk: LuaString = lua.globals().get("script_saw").unwrap();
		assert_eq!(chunk.as_bytes(), b"for the script");

		let mut h = ud.borrow_mut::<SocketHandle>().unwrap();
		assert!(h.teardown());
	}
}
