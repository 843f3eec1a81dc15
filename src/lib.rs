use mlua::prelude::*;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

mod bridge;
mod cert;
mod config;
mod conversion;
mod core;
mod dispatch;
mod endpoint;
mod error;
mod handlers;
mod ioutil;
mod listener;
mod stream;
mod tls;
mod verify;
mod wrap;

/**
Build the module table exported to the script.

`server.loop` runs the dispatch loop until nothing keeps it alive; all
socket constructors must be called before entering it (or from within its
callbacks).
*/
pub fn open_module(lua: &Lua) -> LuaResult<LuaTable> {
	// Nothing expects the ~spanish inquisition~ SIGPIPE, so we mask it here.
	// Normally, rust masks SIGPIPE on its own:
	// https://github.com/rust-lang/rust/issues/62569
	// But as its part of the startup code, it doesn't get executed when
	// loading as a library. So we do it here.

	// We don't care about the result, only that it's successful, so the
	// safety concerns do not apply to us.
	#[cfg(unix)]
	unsafe { nix::sys::signal::signal(
		nix::sys::signal::Signal::SIGPIPE,
		nix::sys::signal::SigHandler::SigIgn,
	).unwrap() };

	let exports = lua.create_table()?;

	let server = lua.create_table()?;
	server.set("loop", lua.create_function(dispatch::mainloop)?)?;
	server.set("shutdown", lua.create_function(dispatch::shutdown)?)?;
	server.set("listen", lua.create_function(listener::listen)?)?;
	server.set("connect", lua.create_function(stream::connect)?)?;
	server.set("wrapfd", lua.create_function(stream::wrapfd)?)?;
	server.set("upgradetls", lua.create_function(wrap::upgrade_tls)?)?;
	server.set("upgradeduplex", lua.create_function(bridge::upgrade_duplex)?)?;
	server.set("new_tls_config", lua.create_function(tls::new_tls_config)?)?;
	server.set("reconfigure", lua.create_function(config::reconfigure)?)?;
	exports.set("server", server)?;

	exports.set("version", VERSION)?;

	Ok(exports)
}

#[cfg(feature = "module")]
#[mlua::lua_module]
fn librsocket(lua: &Lua) -> LuaResult<LuaTable> {
	open_module(lua)
}
