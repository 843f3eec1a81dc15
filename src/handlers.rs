/*!
# User callback records

Each listener or outbound connection carries a [`HandlerSet`]: the validated
record of script callbacks, the inbound payload representation, and the
count of engines currently referencing it. The callback table is protected
in the Lua registry for the lifetime of the set; dropping the set raises the
GC flag so the dispatch loop expires the registry entry.
*/
use mlua::prelude::*;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;

use crate::conversion::BytesView;
use crate::core::LuaRegistryHandle;
use crate::error::ArgError;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
	Data,
	Drain,
	Open,
	Close,
	Timeout,
	ConnectError,
	End,
	Error,
	Handshake,
}

impl Event {
	pub(crate) const ALL: [Event; 9] = [
		Event::Data,
		Event::Drain,
		Event::Open,
		Event::Close,
		Event::Timeout,
		Event::ConnectError,
		Event::End,
		Event::Error,
		Event::Handshake,
	];

	pub(crate) fn name(self) -> &'static str {
		match self {
			Self::Data => "data",
			Self::Drain => "drain",
			Self::Open => "open",
			Self::Close => "close",
			Self::Timeout => "timeout",
			Self::ConnectError => "connectError",
			Self::End => "end",
			Self::Error => "error",
			Self::Handshake => "handshake",
		}
	}

	fn bit(self) -> u16 {
		1 << (self as u16)
	}
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryType {
	ArrayBuffer,
	Uint8Array,
	Buffer,
}

impl Default for BinaryType {
	fn default() -> Self {
		Self::Buffer
	}
}

impl BinaryType {
	pub(crate) fn from_str(s: &str) -> Result<Self, ArgError> {
		match s {
			"arraybuffer" => Ok(Self::ArrayBuffer),
			"uint8array" => Ok(Self::Uint8Array),
			"buffer" => Ok(Self::Buffer),
			_ => Err(ArgError::InvalidArguments(format!("unknown binaryType: {:?}", s))),
		}
	}

	/// Materialise an inbound chunk for the `data` callback.
	pub(crate) fn materialize<'l>(self, lua: &'l Lua, data: Bytes) -> LuaResult<LuaValue<'l>> {
		match self {
			Self::ArrayBuffer => Ok(LuaValue::String(lua.create_string(&data)?)),
			Self::Uint8Array | Self::Buffer => {
				Ok(LuaValue::UserData(lua.create_userdata(BytesView(data))?))
			}
		}
	}
}


pub(crate) struct HandlerSet {
	key: LuaRegistryHandle,
	present: u16,
	pub(crate) binary_type: BinaryType,
	pub(crate) is_server: bool,
	active: AtomicU32,
	promise: Option<LuaRegistryHandle>,
	default_data: Option<LuaRegistryHandle>,
}

/// Scope guard for a callback dispatch; keeps the set counted as busy even
/// if the callback errors out.
pub(crate) struct EnterGuard<'a>(&'a HandlerSet);

impl<'a> Drop for EnterGuard<'a> {
	fn drop(&mut self) {
		self.0.active.fetch_sub(1, Ordering::SeqCst);
	}
}

impl HandlerSet {
	pub(crate) fn from_options<'l>(
		lua: &'l Lua,
		callbacks: LuaTable<'l>,
		binary_type: BinaryType,
		is_server: bool,
		promise: Option<LuaTable<'l>>,
		default_data: Option<LuaValue<'l>>,
	) -> LuaResult<Arc<Self>> {
		let mut present = 0u16;
		for ev in Event::ALL {
			match callbacks.raw_get::<_, LuaValue>(ev.name())? {
				LuaValue::Nil => (),
				LuaValue::Function(_) => present |= ev.bit(),
				other => {
					return Err(ArgError::InvalidArguments(format!(
						"callback {:?} must be a function, got {}",
						ev.name(),
						other.type_name()
					)).into())
				}
			}
		}
		if present & (Event::Data.bit() | Event::Drain.bit()) == 0 {
			return Err(ArgError::MissingCallback.into());
		}

		let promise = match promise {
			Some(tbl) => {
				for field in ["resolve", "reject"] {
					match tbl.raw_get::<_, LuaValue>(field)? {
						LuaValue::Function(_) => (),
						_ => {
							return Err(ArgError::InvalidArguments(format!(
								"promise.{} must be a function",
								field
							)).into())
						}
					}
				}
				Some(lua.create_registry_value(tbl)?.into())
			}
			None => None,
		};
		let default_data = match default_data {
			Some(LuaValue::Nil) | None => None,
			Some(v) => Some(lua.create_registry_value(v)?.into()),
		};

		Ok(Arc::new(Self {
			key: lua.create_registry_value(callbacks)?.into(),
			present,
			binary_type,
			is_server,
			active: AtomicU32::new(0),
			promise,
			default_data,
		}))
	}

	pub(crate) fn has(&self, ev: Event) -> bool {
		self.present & ev.bit() != 0
	}

	pub(crate) fn get_function<'l>(&self, lua: &'l Lua, ev: Event) -> LuaResult<Option<LuaFunction<'l>>> {
		if !self.has(ev) {
			return Ok(None);
		}
		let tbl = lua.registry_value::<LuaTable>(&*self.key)?;
		tbl.raw_get::<_, Option<LuaFunction>>(ev.name())
	}

	pub(crate) fn default_data<'l>(&self, lua: &'l Lua) -> LuaResult<LuaValue<'l>> {
		match &self.default_data {
			Some(key) => lua.registry_value::<LuaValue>(&**key),
			None => Ok(LuaValue::Nil),
		}
	}

	/// Engine lifecycle accounting: one increment per live engine
	/// referencing this set.
	pub(crate) fn mark_active(&self) -> u32 {
		self.active.fetch_add(1, Ordering::SeqCst) + 1
	}

	pub(crate) fn mark_inactive(&self) -> u32 {
		self.active.fetch_sub(1, Ordering::SeqCst) - 1
	}

	pub(crate) fn active_connections(&self) -> u32 {
		self.active.load(Ordering::SeqCst)
	}

	/// Temporary hold for the duration of a callback dispatch.
	pub(crate) fn enter(&self) -> EnterGuard<'_> {
		self.active.fetch_add(1, Ordering::SeqCst);
		EnterGuard(self)
	}

	/// Invoke the script's `error` handler; without one the error is
	/// reported uncaught. Errors raised by the error handler itself are
	/// reported uncaught, never recursed.
	pub(crate) fn call_error_handler<'l>(&self, lua: &'l Lua, this: LuaValue<'l>, err: &str) {
		match self.get_function(lua, Event::Error) {
			Ok(Some(func)) => {
				if let Err(e) = func.call::<_, ()>((this, err.to_string())) {
					log::error!("error handler failed: {} (original error: {})", e, err);
				}
			}
			Ok(None) => {
				log::error!("uncaught socket error: {}", err);
			}
			Err(e) => {
				log::error!("failed to look up error handler: {} (original error: {})", e, err);
			}
		}
	}

	fn promise_call<'l>(&self, lua: &'l Lua, which: &str, arg: LuaValue<'l>) -> LuaResult<bool> {
		let key = match &self.promise {
			Some(key) => key,
			None => return Ok(false),
		};
		let tbl = lua.registry_value::<LuaTable>(&**key)?;
		let func = tbl.raw_get::<_, LuaFunction>(which)?;
		func.call::<_, ()>(arg)?;
		Ok(true)
	}

	pub(crate) fn resolve_promise<'l>(&self, lua: &'l Lua, value: LuaValue<'l>) -> LuaResult<bool> {
		self.promise_call(lua, "resolve", value)
	}

	pub(crate) fn reject_promise<'l>(&self, lua: &'l Lua, err: LuaValue<'l>) -> LuaResult<bool> {
		self.promise_call(lua, "reject", err)
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	fn callbacks<'l>(lua: &'l Lua, names: &[&str]) -> LuaTable<'l> {
		let tbl = lua.create_table().unwrap();
		for name in names {
			let f = lua.create_function(|_, ()| Ok(())).unwrap();
			tbl.set(*name, f).unwrap();
		}
		tbl
	}

	#[test]
	fn requires_data_or_drain() {
		let lua = Lua::new();
		let tbl = callbacks(&lua, &["open", "close"]);
		assert!(HandlerSet::from_options(&lua, tbl, BinaryType::Buffer, false, None, None).is_err());
		let tbl = callbacks(&lua, &["data"]);
		assert!(HandlerSet::from_options(&lua, tbl, BinaryType::Buffer, false, None, None).is_ok());
		let tbl = callbacks(&lua, &["drain"]);
		assert!(HandlerSet::from_options(&lua, tbl, BinaryType::Buffer, false, None, None).is_ok());
	}

	#[test]
	fn rejects_non_callable_handlers() {
		let lua = Lua::new();
		let tbl = callbacks(&lua, &["data"]);
		tbl.set("open", "definitely not a function").unwrap();
		assert!(HandlerSet::from_options(&lua, tbl, BinaryType::Buffer, false, None, None).is_err());
	}

	#[test]
	fn presence_bits() {
		let lua = Lua::new();
		let tbl = callbacks(&lua, &["data", "handshake", "connectError"]);
		let hs = HandlerSet::from_options(&lua, tbl, BinaryType::Buffer, false, None, None).unwrap();
		assert!(hs.has(Event::Data));
		assert!(hs.has(Event::Handshake));
		assert!(hs.has(Event::ConnectError));
		assert!(!hs.has(Event::Drain));
		assert!(!hs.has(Event::End));
	}

	#[test]
	fn active_connection_accounting() {
		let lua = Lua::new();
		let tbl = callbacks(&lua, &["data"]);
		let hs = HandlerSet::from_options(&lua, tbl, BinaryType::Buffer, false, None, None).unwrap();
		assert_eq!(hs.active_connections(), 0);
		assert_eq!(hs.mark_active(), 1);
		{
			let _guard = hs.enter();
			assert_eq!(hs.active_connections(), 2);
		}
		assert_eq!(hs.active_connections(), 1);
		assert_eq!(hs.mark_inactive(), 0);
	}

	#[test]
	fn binary_type_tokens() {
		assert!(BinaryType::from_str("arraybuffer").is_ok());
		assert!(BinaryType::from_str("uint8array").is_ok());
		assert!(BinaryType::from_str("buffer").is_ok());
		assert!(BinaryType::from_str("blob").is_err());
	}

	#[test]
	fn promise_shape_is_validated() {
		let lua = Lua::new();
		let tbl = callbacks(&lua, &["data"]);
		let promise = lua.create_table().unwrap();
		promise.set("resolve", lua.create_function(|_, ()| Ok(())).unwrap()).unwrap();
		// reject missing
		assert!(HandlerSet::from_options(&lua, tbl, BinaryType::Buffer, false, Some(promise), None).is_err());
	}
}
