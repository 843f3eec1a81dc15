use mlua::prelude::*;

use std::net::IpAddr;
use std::time::Duration;

use bytes::Bytes;


#[macro_export]
macro_rules! strerror {
	($e:expr) => {
		match $e {
			Ok(v) => v,
			Err(e) => return Err(format!("{}", e)),
		}
	}
}


#[macro_export]
macro_rules! strerror_ok {
	($e:expr) => {
		match $e {
			Ok(v) => v,
			Err(e) => return Ok(Err(format!("{}", e))),
		}
	}
}


pub(crate) fn opaque<T: Into<String>>(msg: T) -> LuaError {
	LuaError::RuntimeError(msg.into())
}


pub(crate) fn borrow_str<'l>(v: &'l LuaValue<'l>) -> Result<&'l str, String> {
	match v {
		LuaValue::String(s) => match s.to_str() {
			Ok(v) => Ok(v),
			Err(e) => Err(format!("invalid string: {}", e)),
		},
		_ => Err(format!("expected string, found {}", v.type_name())),
	}
}


pub(crate) fn to_ipaddr<'l>(addr: &LuaValue<'l>) -> Result<IpAddr, String> {
	let addr = borrow_str(&addr)?;
	if addr == "*" {
		Ok(IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0)))
	} else {
		match addr.parse::<IpAddr>() {
			Ok(v) => Ok(v),
			Err(e) => Err(format!("invalid IP address ({}): {}", e, addr)),
		}
	}
}


pub(crate) fn to_duration<'l>(v: LuaValue<'l>) -> Result<Duration, String> {
	match v {
		LuaValue::Integer(i) if i >= 0 => Ok(Duration::from_secs(i as u64)),
		LuaValue::Number(f) if f >= 0.0 => Ok(Duration::from_secs_f64(f)),
		_ => Err(format!("expected non-negative number, found {}", v.type_name())),
	}
}


/**
Received payload exposed to the script as an indexable byte slice instead of
an interned string.

Which representation the `data` callback receives is selected via the
`binaryType` socket option.
*/
pub(crate) struct BytesView(pub(crate) Bytes);

impl LuaUserData for BytesView {
	fn add_methods<'lua, M: LuaUserDataMethods<'lua, Self>>(methods: &mut M) {
		methods.add_method("tostring", |lua, this: &Self, _: ()| -> LuaResult<LuaString> {
			lua.create_string(&this.0)
		});

		methods.add_method("byte", |_, this: &Self, i: usize| -> LuaResult<Option<u8>> {
			// 1-based, like string.byte
			if i == 0 {
				return Ok(None);
			}
			Ok(this.0.get(i - 1).copied())
		});

		methods.add_method("sub", |lua, this: &Self, (i, j): (usize, Option<usize>)| -> LuaResult<LuaString> {
			let len = this.0.len();
			let start = i.saturating_sub(1).min(len);
			let stop = j.unwrap_or(len).min(len);
			if start >= stop {
				return lua.create_string(b"");
			}
			lua.create_string(&this.0[start..stop])
		});

		methods.add_meta_method(LuaMetaMethod::Len, |_, this: &Self, _: ()| -> LuaResult<usize> {
			Ok(this.0.len())
		});

		methods.add_meta_method(LuaMetaMethod::ToString, |lua, this: &Self, _: ()| -> LuaResult<LuaString> {
			lua.create_string(&this.0)
		});
	}
}
