use std::sync::Mutex;

use mlua::prelude::*;

// The runtime, main channel and keep-alive counter are process globals;
// run one scripted scenario at a time.
static TEST_LOCK: Mutex<()> = Mutex::new(());

fn run_script(script: &str) -> Lua {
	let lua = Lua::new();
	let exports = librsocket::open_module(&lua).unwrap();
	lua.globals().set("net", exports).unwrap();
	lua.globals().set("result", lua.create_table().unwrap()).unwrap();
	if let Err(e) = lua.load(script).exec() {
		panic!("script failed: {}", e);
	}
	lua
}

fn result_str(lua: &Lua, key: &str) -> Option<String> {
	let result: LuaTable = lua.globals().get("result").unwrap();
	result.get::<_, Option<String>>(key).unwrap()
}

fn result_bool(lua: &Lua, key: &str) -> Option<bool> {
	let result: LuaTable = lua.globals().get("result").unwrap();
	result.get::<_, Option<bool>>(key).unwrap()
}

fn result_int(lua: &Lua, key: &str) -> Option<i64> {
	let result: LuaTable = lua.globals().get("result").unwrap();
	result.get::<_, Option<i64>>(key).unwrap()
}

#[test]
fn loopback_echo() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		local srv
		srv = net.server.listen{
			host = "127.0.0.1", port = 0,
			binaryType = "arraybuffer",
			socket = {
				open = function(sock)
					result.srv_open = true
				end,
				data = function(sock, chunk)
					result.srv_data = chunk
					sock:write(chunk)
					sock:close()
				end,
				close = function(sock, err)
					result.srv_close = err or 0
				end,
			},
		}
		local client = net.server.connect{
			host = "127.0.0.1", port = srv:port(),
			binaryType = "arraybuffer",
			socket = {
				open = function(sock)
					result.cli_open = true
					result.frag_low = pcall(sock.set_max_send_fragment, sock, 511)
					result.frag_high = pcall(sock.set_max_send_fragment, sock, 16385)
					result.frag_ok = pcall(sock.set_max_send_fragment, sock, 512)
					result.frag_top = pcall(sock.set_max_send_fragment, sock, 16384)
					result.wrote = sock:write("hello")
				end,
				data = function(sock, chunk)
					result.cli_data = chunk
				end,
				["end"] = function(sock)
					result.cli_end = true
				end,
				close = function(sock, err)
					result.cli_close = err or 0
					srv:close()
				end,
			},
		}
		net.server["loop"]()
	"#);
	assert_eq!(result_bool(&lua, "srv_open"), Some(true));
	assert_eq!(result_bool(&lua, "cli_open"), Some(true));
	assert_eq!(result_str(&lua, "srv_data").as_deref(), Some("hello"));
	assert_eq!(result_str(&lua, "cli_data").as_deref(), Some("hello"));
	assert_eq!(result_int(&lua, "wrote"), Some(5));
	assert_eq!(result_bool(&lua, "cli_end"), Some(true));
	assert_eq!(result_int(&lua, "srv_close"), Some(0));
	assert_eq!(result_int(&lua, "cli_close"), Some(0));
	// fragment size boundaries
	assert_eq!(result_bool(&lua, "frag_low"), Some(false));
	assert_eq!(result_bool(&lua, "frag_high"), Some(false));
	assert_eq!(result_bool(&lua, "frag_ok"), Some(true));
	assert_eq!(result_bool(&lua, "frag_top"), Some(true));
}

#[test]
fn backpressure_staging_and_drain() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		net.server.reconfigure{write_hwm = 4096}
		local total = 1024 * 1024
		local payload = string.rep("x", total)
		local received = 0
		local srv
		srv = net.server.listen{
			host = "127.0.0.1", port = 0,
			binaryType = "arraybuffer",
			socket = {
				data = function(sock, chunk)
					received = received + #chunk
					if received >= total then
						result.received = received
						sock:close()
					end
				end,
				close = function(sock) end,
			},
		}
		local client = net.server.connect{
			host = "127.0.0.1", port = srv:port(),
			socket = {
				open = function(sock)
					result.fully = sock:writebuffered(payload)
					result.backlog_after = sock:backlog()
				end,
				data = function() end,
				drain = function(sock)
					result.drained = true
					result.backlog_drained = sock:backlog()
					result.written = sock:byteswritten()
				end,
				close = function(sock, err)
					srv:close()
				end,
			},
		}
		net.server["loop"]()
		net.server.reconfigure{}
	"#);
	assert_eq!(result_bool(&lua, "fully"), Some(false));
	let staged = result_int(&lua, "backlog_after").unwrap();
	assert!(staged > 0 && staged <= 1024 * 1024 - 4096, "staged = {}", staged);
	assert_eq!(result_bool(&lua, "drained"), Some(true));
	assert_eq!(result_int(&lua, "backlog_drained"), Some(0));
	assert_eq!(result_int(&lua, "written"), Some(1024 * 1024));
	assert_eq!(result_int(&lua, "received"), Some(1024 * 1024));
}

#[cfg(unix)]
#[test]
fn connect_missing_unix_path() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		local order = 0
		net.server.connect{
			unix = "/nonexistent/rsocket-test/path.sock",
			socket = {
				data = function() end,
				connectError = function(sock, err)
					order = order + 1
					result.cb_order = order
					result.code = err.code
					result.syscall = err.syscall
				end,
			},
			promise = {
				resolve = function() result.resolved = true end,
				reject = function(err)
					order = order + 1
					result.reject_order = order
					result.reject_code = err.code
				end,
			},
		}
		net.server["loop"]()
	"#);
	assert_eq!(result_str(&lua, "code").as_deref(), Some("ENOENT"));
	assert_eq!(result_str(&lua, "syscall").as_deref(), Some("connect"));
	// the callback fires first, then the promise is rejected as handled
	assert_eq!(result_int(&lua, "cb_order"), Some(1));
	assert_eq!(result_int(&lua, "reject_order"), Some(2));
	assert_eq!(result_str(&lua, "reject_code").as_deref(), Some("ENOENT"));
	assert_eq!(result_bool(&lua, "resolved"), None);
}

#[test]
fn connect_refused() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		-- bind and close a listener to find a port nobody listens on
		local probe = net.server.listen{
			host = "127.0.0.1", port = 0,
			socket = { data = function() end },
		}
		local port = probe:port()
		probe:close()
		net.server.connect{
			host = "127.0.0.1", port = port,
			socket = {
				data = function() end,
				connectError = function(sock, err)
					result.code = err.code
					result.errno = err.errno
				end,
			},
		}
		net.server["loop"]()
	"#);
	assert_eq!(result_str(&lua, "code").as_deref(), Some("ECONNREFUSED"));
	assert!(result_int(&lua, "errno").unwrap() != 0);
}

#[test]
fn listener_stop_is_idempotent() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		local srv = net.server.listen{
			host = "127.0.0.1", port = 0,
			socket = { data = function() end },
		}
		result.port = srv:port()
		srv:close(false)
		srv:close(false)
		srv:close()
		net.server["loop"]()
		result.done = true
	"#);
	assert!(result_int(&lua, "port").unwrap() > 0);
	assert_eq!(result_bool(&lua, "done"), Some(true));
}

#[test]
fn reload_swaps_handlers_for_later_accepts() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		local srv
		local function second_client()
			net.server.connect{
				host = "127.0.0.1", port = srv:port(),
				socket = {
					open = function(sock) sock:write("two") end,
					data = function() end,
					close = function() srv:close() end,
				},
			}
		end
		srv = net.server.listen{
			host = "127.0.0.1", port = 0,
			binaryType = "arraybuffer",
			socket = {
				data = function(sock, chunk)
					result.first = chunk
					sock:close()
				end,
			},
		}
		net.server.connect{
			host = "127.0.0.1", port = srv:port(),
			socket = {
				open = function(sock) sock:write("one") end,
				data = function() end,
				close = function()
					srv:reload{
						data = function(sock, chunk)
							result.second = chunk
							sock:close()
						end,
					}
					second_client()
				end,
			},
		}
		net.server["loop"]()
	"#);
	assert_eq!(result_str(&lua, "first").as_deref(), Some("one"));
	assert_eq!(result_str(&lua, "second").as_deref(), Some("two"));
}

#[test]
fn idle_timeout_fires_and_leaves_socket_open() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		local srv
		srv = net.server.listen{
			host = "127.0.0.1", port = 0,
			socket = {
				data = function() end,
			},
		}
		net.server.connect{
			host = "127.0.0.1", port = srv:port(),
			socket = {
				open = function(sock)
					sock:settimeout(0.2)
				end,
				data = function() end,
				timeout = function(sock)
					if not result.fired then
						result.fired = true
						-- still usable after the timeout fired
						result.write_after = sock:write("x")
						sock:close()
						srv:close(true)
					end
				end,
			},
		}
		net.server["loop"]()
	"#);
	assert_eq!(result_bool(&lua, "fired"), Some(true));
	assert_eq!(result_int(&lua, "write_after"), Some(1));
}

#[test]
fn unref_lets_the_loop_exit() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		local srv
		srv = net.server.listen{
			host = "127.0.0.1", port = 0,
			socket = {
				open = function(sock)
					sock:unref()
				end,
				data = function() end,
			},
		}
		net.server.connect{
			host = "127.0.0.1", port = srv:port(),
			socket = {
				open = function(sock)
					-- balanced ref/unref first, then drop the loop ref
					sock:ref()
					sock:unref()
					sock:unref()
					srv:close()
					result.open = true
				end,
				data = function() end,
			},
		}
		net.server["loop"]()
		result.done = true
	"#);
	assert_eq!(result_bool(&lua, "open"), Some(true));
	assert_eq!(result_bool(&lua, "done"), Some(true));
}

#[test]
fn invalid_option_shapes_are_rejected() {
	let _guard = TEST_LOCK.lock().unwrap();
	let lua = run_script(r#"
		-- port out of range
		result.port_high = pcall(net.server.listen, {
			host = "127.0.0.1", port = 65536,
			socket = { data = function() end },
		})
		result.port_neg = pcall(net.server.connect, {
			host = "127.0.0.1", port = -1,
			socket = { data = function() end },
		})
		-- callbacks must include data or drain
		result.no_cb = pcall(net.server.connect, {
			host = "127.0.0.1", port = 1,
			socket = { open = function() end },
		})
		-- non-callable handler
		result.bad_cb = pcall(net.server.connect, {
			host = "127.0.0.1", port = 1,
			socket = { data = "nope" },
		})
		-- empty hostname
		result.empty_host = pcall(net.server.connect, {
			host = "",
			port = 1,
			socket = { data = function() end },
		})
		-- encoding combined with a window
		local srv = net.server.listen{
			host = "127.0.0.1", port = 0,
			socket = { data = function() end },
		}
		net.server.connect{
			host = "127.0.0.1", port = srv:port(),
			socket = {
				open = function(sock)
					result.enc_window = pcall(sock.write, sock, "abcdef", 1, 2, "utf8")
					result.window_ok = sock:write("abcdef", 1, 2)
					sock:close()
					srv:close()
				end,
				data = function() end,
			},
		}
		net.server["loop"]()
	"#);
	assert_eq!(result_bool(&lua, "port_high"), Some(false));
	assert_eq!(result_bool(&lua, "port_neg"), Some(false));
	assert_eq!(result_bool(&lua, "no_cb"), Some(false));
	assert_eq!(result_bool(&lua, "bad_cb"), Some(false));
	assert_eq!(result_bool(&lua, "empty_host"), Some(false));
	assert_eq!(result_bool(&lua, "enc_window"), Some(false));
	assert_eq!(result_int(&lua, "window_ok"), Some(2));
}
