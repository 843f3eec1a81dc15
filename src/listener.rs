/**
# Listener sockets for stream connections

Listener sockets bind a TCP endpoint, a Unix path or a Windows pipe name.
They may carry a server-side TLS context, in which case every accepted
connection completes its handshake before the script sees it; the context
is shared across all accepts and freed when the last connection drops it.
*/
use mlua::prelude::*;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use log::{warn, error};

use tokio::select;
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;

use tokio_rustls::TlsAcceptor;

use crate::config;
use crate::config::CONFIG;
use crate::core::{MAIN_CHANNEL, Message, Spawn, LuaRegistryHandle};
use crate::endpoint;
use crate::endpoint::Endpoint;
use crate::error::{ArgError, SysError};
use crate::handlers::HandlerSet;
use crate::ioutil::iotimeout;
use crate::stream;
use crate::stream::AddrStr;
use crate::tls;
use crate::with_runtime_lua;

/**
Control if and how TLS is accepted on listener sockets.
*/
#[derive(Clone)]
enum TlsMode {
	/// Plaintext accepts; a later in-place upgrade needs its own context.
	Plain,
	/// TLS is always attempted and if it fails, the script side will never
	/// see the connection.
	DirectTls{
		tls: tls::ServerTls,
	},
}

impl fmt::Debug for TlsMode {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Plain => f.debug_struct("TlsMode::Plain").finish(),
			Self::DirectTls{..} => f.debug_struct("TlsMode::DirectTls").finish_non_exhaustive(),
		}
	}
}

enum Accepted {
	Tcp(TcpStream, AddrStr),
	#[cfg(unix)]
	Unix(UnixStream, AddrStr),
	#[cfg(windows)]
	Pipe(Box<dyn stream::DuplexIo>, AddrStr),
}

enum ListenSocket {
	Tcp(TcpListener),
	#[cfg(unix)]
	Unix(UnixListener),
	#[cfg(windows)]
	Pipe{
		name: String,
		pending: Option<tokio::net::windows::named_pipe::NamedPipeServer>,
	},
}

impl ListenSocket {
	async fn accept(&mut self) -> io::Result<Accepted> {
		match self {
			Self::Tcp(sock) => {
				let (conn, addr) = sock.accept().await?;
				Ok(Accepted::Tcp(conn, addr.into()))
			},
			#[cfg(unix)]
			Self::Unix(sock) => {
				let (conn, addr) = sock.accept().await?;
				let remote = match addr.as_pathname() {
					Some(path) => AddrStr::Unix{path: path.to_string_lossy().into()},
					None => AddrStr::Unspecified,
				};
				Ok(Accepted::Unix(conn, remote))
			},
			#[cfg(windows)]
			Self::Pipe{name, pending} => {
				use tokio::net::windows::named_pipe::ServerOptions;
				let server = match pending.take() {
					Some(server) => server,
					None => ServerOptions::new().create(name.as_str())?,
				};
				server.connect().await?;
				let remote = AddrStr::Pipe{name: name.clone()};
				Ok(Accepted::Pipe(Box::new(server), remote))
			},
		}
	}
}

impl TlsMode {
	/// Complete the accept (including the handshake on direct-TLS
	/// listeners) and produce the dispatch message.
	async fn accept(
		&self,
		handle: &LuaRegistryHandle,
		accepted: Accepted,
		handshake_timeout: Duration,
	) -> io::Result<Message> {
		match self {
			Self::Plain => {
				let (stream, remote) = match accepted {
					Accepted::Tcp(conn, remote) => (conn.into(), remote),
					#[cfg(unix)]
					Accepted::Unix(conn, remote) => (conn.into(), remote),
					#[cfg(windows)]
					Accepted::Pipe(conn, remote) => (stream::FdStream::virtual_stream(stream::Stream::from(conn)), remote),
				};
				Ok(Message::Accepted{
					handle: handle.clone(),
					stream,
					remote,
				})
			},
			Self::DirectTls{tls: parts} => {
				let acceptor: TlsAcceptor = parts.cfg.clone().into();
				match accepted {
					Accepted::Tcp(conn, remote) => {
						let (verify, sock) = parts.recorder.scope(iotimeout(
							handshake_timeout,
							acceptor.accept(conn),
							"TLS handshake timed out",
						)).await;
						let sock = sock?;
						let info = tls::Info::from_server_conn(sock.get_ref().1)
							.with_verify(verify)
							.with_local_certs(parts.resolver.default_certs());
						Ok(Message::AcceptedTls{
							handle: handle.clone(),
							stream: sock.into(),
							remote,
							info,
						})
					},
					#[cfg(unix)]
					Accepted::Unix(conn, remote) => {
						let (verify, sock) = parts.recorder.scope(iotimeout(
							handshake_timeout,
							acceptor.accept(conn),
							"TLS handshake timed out",
						)).await;
						let sock = sock?;
						let info = tls::Info::from_server_conn(sock.get_ref().1)
							.with_verify(verify)
							.with_local_certs(parts.resolver.default_certs());
						Ok(Message::AcceptedTls{
							handle: handle.clone(),
							stream: sock.into(),
							remote,
							info,
						})
					},
					#[cfg(windows)]
					Accepted::Pipe(conn, remote) => {
						let (verify, sock) = parts.recorder.scope(iotimeout(
							handshake_timeout,
							acceptor.accept(conn),
							"TLS handshake timed out",
						)).await;
						let sock = sock?;
						let info = tls::Info::from_server_conn(sock.get_ref().1)
							.with_verify(verify)
							.with_local_certs(parts.resolver.default_certs());
						Ok(Message::AcceptedTls{
							handle: handle.clone(),
							stream: stream::FdStream::virtual_stream(stream::Stream::from(sock)),
							remote,
							info,
						})
					},
				}
			},
		}
	}
}

/**
Messages to control the behaviour of listener sockets.
*/
enum ControlMessage {
	/// Stop accepting. With `force`, existing connections are torn down as
	/// well; otherwise they drain naturally.
	Close{
		force: bool,
	},
}

/// Control senders of the connections accepted by one listener, for
/// forced shutdown.
pub(crate) type ConnRegistry = Arc<Mutex<Vec<mpsc::UnboundedSender<stream::ControlMessage>>>>;

struct ListenerWorker {
	rx: mpsc::UnboundedReceiver<ControlMessage>,
	sock: ListenSocket,
	tls_mode: TlsMode,
	server_cfg: config::ServerConfig,
	stream_cfg: config::StreamConfig,
	conns: ConnRegistry,
	handle: LuaRegistryHandle,
}

impl ListenerWorker {
	async fn run(mut self) {
		loop {
			select! {
				msg = self.rx.recv() => match msg {
					Some(ControlMessage::Close{force}) => {
						if force {
							let conns = self.conns.lock().unwrap();
							for tx in conns.iter() {
								let _ = tx.send(stream::ControlMessage::Terminate);
							}
						}
						return;
					},
					None => return,
				},
				conn = self.sock.accept() => match conn {
					Ok(accepted) => {
						let msg = match self.tls_mode.accept(&self.handle, accepted, self.stream_cfg.ssl_handshake_timeout).await {
							Ok(msg) => msg,
							Err(e) => {
								warn!("failed to fully accept connection: {}", e);
								continue;
							},
						};
						// we don't care about failure here; this can only fail during shutdown when nobody else cares anymore either.
						let _ = MAIN_CHANNEL.send(msg).await;
					},
					Err(e) => {
						error!("failed to accept socket: {}. backing off", e);
						tokio::time::sleep(self.server_cfg.accept_retry_interval).await;
					},
				},
				// when the global tx queue is gone, we don't need to accept anything anymore and can just go to rest
				_ = MAIN_CHANNEL.closed() => return,
			}
		}
	}
}

impl Spawn for ListenerWorker {
	fn spawn(self) {
		tokio::spawn(async move { self.run().await });
	}
}

pub(crate) struct ListenerHandle {
	tx: mpsc::UnboundedSender<ControlMessage>,
	// so that we do not need a roundtrip to the worker to discover these when the script asks
	pub(crate) local: AddrStr,
	handlers: RwLock<Arc<HandlerSet>>,
	pub(crate) tls: Option<tls::ServerTls>,
	pub(crate) conns: ConnRegistry,
	pub(crate) allow_half_open: bool,
	closed: bool,
}

impl ListenerHandle {
	pub(crate) fn current_handlers(&self) -> Arc<HandlerSet> {
		self.handlers.read().unwrap().clone()
	}

	pub(crate) fn register_conn(&self, tx: mpsc::UnboundedSender<stream::ControlMessage>) {
		let mut conns = self.conns.lock().unwrap();
		conns.retain(|tx| !tx.is_closed());
		conns.push(tx);
	}

	fn stop(&mut self, force: bool) {
		// safely idempotent
		let _ = self.tx.send(ControlMessage::Close{force});
		if !self.closed {
			self.closed = true;
			crate::core::keepalive_release();
		}
	}
}

impl LuaUserData for ListenerHandle {
	fn add_methods<'lua, M: LuaUserDataMethods<'lua, Self>>(methods: &mut M) {
		methods.add_method("ip", |_, this: &Self, _: ()| -> LuaResult<Option<String>> {
			Ok(this.local.addr().map(|x| x.to_string()))
		});

		methods.add_method("port", |_, this: &Self, _: ()| -> LuaResult<Option<u16>> {
			Ok(this.local.port())
		});

		methods.add_method("serverport", |_, this: &Self, _: ()| -> LuaResult<Option<u16>> {
			Ok(this.local.port())
		});

		methods.add_method("active_connections", |_, this: &Self, _: ()| -> LuaResult<u32> {
			Ok(this.current_handlers().active_connections())
		});

		methods.add_method_mut("close", |_, this: &mut Self, force: Option<bool>| -> LuaResult<()> {
			this.stop(force.unwrap_or(false));
			Ok(())
		});

		// swapping the callback record is observable only for connections
		// accepted afterwards
		methods.add_method("reload", |lua, this: &Self, (callbacks, data): (LuaTable, Option<LuaValue>)| -> LuaResult<()> {
			let current = this.current_handlers();
			let new_handlers = HandlerSet::from_options(
				lua,
				callbacks,
				current.binary_type,
				true,
				None,
				data,
			)?;
			*this.handlers.write().unwrap() = new_handlers;
			Ok(())
		});

		methods.add_method("add_server_name", |_, this: &Self, (hostname, options): (LuaString, LuaTable)| -> LuaResult<Result<bool, String>> {
			let hostname = hostname.to_str()?;
			if hostname.is_empty() {
				return Ok(Err("empty server name".to_string()));
			}
			let parts = match &this.tls {
				Some(parts) => parts,
				None => return Ok(Err("listener has no TLS context".to_string())),
			};
			let keypair = match tls::certified_key_from_options(&options) {
				Ok(Some(v)) => v,
				Ok(None) => return Ok(Err("certificate and key are required".to_string())),
				Err(e) => return Ok(Err(format!("{}", e))),
			};
			parts.resolver.set_keypair(hostname, Arc::new(keypair));
			Ok(Ok(true))
		});
	}
}

impl Drop for ListenerHandle {
	fn drop(&mut self) {
		if !self.closed {
			self.closed = true;
			crate::core::keepalive_release();
		}
	}
}

struct BindOptions {
	exclusive: bool,
	reuse_port: bool,
	ipv6_only: bool,
}

fn bind_tcp(host: &str, port: u16, opts: &BindOptions) -> Result<std::net::TcpListener, SysError> {
	let wrap = |e: io::Error| SysError::new("listen", &e).with_address(host, Some(port));
	let ip: std::net::IpAddr = if host == "*" {
		std::net::IpAddr::V4(std::net::Ipv4Addr::new(0, 0, 0, 0))
	} else {
		match host.parse() {
			Ok(ip) => ip,
			Err(e) => {
				return Err(SysError{
					syscall: "listen",
					code: "EINVAL".to_string(),
					errno: 0,
					message: format!("listeners require a literal IP address ({})", e),
					address: Some(host.to_string()),
					port: Some(port),
				})
			},
		}
	};
	let addr = SocketAddr::new(ip, port);
	let domain = socket2::Domain::for_address(addr);
	let sock = socket2::Socket::new(domain, socket2::Type::STREAM, None).map_err(wrap)?;
	if addr.is_ipv6() {
		sock.set_only_v6(opts.ipv6_only).map_err(wrap)?;
	}
	if !opts.exclusive {
		sock.set_reuse_address(true).map_err(wrap)?;
	}
	#[cfg(unix)]
	if opts.reuse_port {
		sock.set_reuse_port(true).map_err(wrap)?;
	}
	sock.bind(&addr.into()).map_err(wrap)?;
	sock.listen(1024).map_err(wrap)?;
	sock.set_nonblocking(true).map_err(wrap)?;
	Ok(sock.into())
}

/**
Bind a listener.

Options: the endpoint (`host`/`port`, `unix`, or a pipe name), the `socket`
callback record, `tls` (server-mode config), `binaryType`, `data`,
`allowHalfOpen`, `exclusive`, `reusePort` and `ipv6Only`.

Bind failures raise a structured error carrying the syscall, code, errno,
address and port.
*/
pub(crate) fn listen<'l>(lua: &'l Lua, options: LuaTable<'l>) -> LuaResult<LuaAnyUserData<'l>> {
	let ep = endpoint::from_options(&options).map_err(LuaError::from)?;
	let callbacks = match options.get::<_, Option<LuaTable>>("socket")? {
		Some(v) => v,
		None => return Err(ArgError::InvalidArguments("socket callback record is required".into()).into()),
	};
	let binary_type = stream::parse_binary_type(&options)?;
	let allow_half_open = options.get::<_, Option<bool>>("allowHalfOpen")?.unwrap_or(false);
	let default_data = options.get::<_, LuaValue>("data")?;
	let bind_opts = BindOptions{
		exclusive: options.get::<_, Option<bool>>("exclusive")?.unwrap_or(false),
		reuse_port: options.get::<_, Option<bool>>("reusePort")?.unwrap_or(false),
		ipv6_only: options.get::<_, Option<bool>>("ipv6Only")?.unwrap_or(false),
	};

	let tls_mode = match stream::tls_option(&options)? {
		None => TlsMode::Plain,
		Some(tls::TlsConfig::Server(parts)) => TlsMode::DirectTls{tls: parts},
		Some(tls::TlsConfig::Client(..)) => {
			return Err(ArgError::InvalidArguments("listeners require a server-mode TLS config".into()).into())
		},
	};

	let (server_cfg, stream_cfg) = {
		let config = CONFIG.read().unwrap();
		(config.server, config.stream)
	};

	let handlers = HandlerSet::from_options(lua, callbacks, binary_type, true, None, Some(default_data))?;

	let (sock, local) = match &ep {
		Endpoint::Tcp{host, port} => {
			let sock = bind_tcp(host, *port, &bind_opts).map_err(LuaError::from)?;
			let local = sock.local_addr().map(AddrStr::from).unwrap_or(AddrStr::Unspecified);
			(BoundSocket::Tcp(sock), local)
		},
		#[cfg(unix)]
		Endpoint::Unix{path} => {
			let sock = std::os::unix::net::UnixListener::bind(path).map_err(|e| {
				LuaError::from(SysError::new("listen", &e).with_address(path.to_string_lossy(), None))
			})?;
			sock.set_nonblocking(true).map_err(|e| {
				LuaError::from(SysError::new("listen", &e).with_address(path.to_string_lossy(), None))
			})?;
			let local = AddrStr::Unix{path: path.to_string_lossy().into()};
			(BoundSocket::Unix(sock), local)
		},
		#[cfg(not(unix))]
		Endpoint::Unix{..} => {
			return Err(ArgError::InvalidArguments("unix sockets are not available on this platform".into()).into())
		},
		#[cfg(windows)]
		Endpoint::Pipe{name} => {
			use tokio::net::windows::named_pipe::ServerOptions;
			let first = {
				let _guard = crate::core::RUNTIME.read().unwrap();
				ServerOptions::new()
					.first_pipe_instance(true)
					.create(name.as_str())
					.map_err(|e| LuaError::from(SysError::new("listen", &e).with_address(name.clone(), None)))?
			};
			(BoundSocket::Pipe{name: name.clone(), first}, AddrStr::Pipe{name: name.clone()})
		},
		#[cfg(not(windows))]
		Endpoint::Pipe{..} => {
			return Err(ArgError::InvalidArguments("named pipes are only available on Windows".into()).into())
		},
		Endpoint::Fd{..} => {
			return Err(ArgError::InvalidArguments("cannot listen on an fd endpoint".into()).into())
		},
	};

	let tls_parts = match &tls_mode {
		TlsMode::DirectTls{tls} => Some(tls.clone()),
		TlsMode::Plain => None,
	};

	let (tx, rx) = mpsc::unbounded_channel();
	let conns: ConnRegistry = Arc::new(Mutex::new(Vec::new()));
	let v: LuaAnyUserData = lua.create_userdata(ListenerHandle{
		tx,
		local,
		handlers: RwLock::new(handlers),
		tls: tls_parts,
		conns: conns.clone(),
		allow_half_open,
		closed: false,
	})?;
	let key: LuaRegistryHandle = lua.create_registry_value(v.clone())?.into();
	crate::core::keepalive_acquire();

	with_runtime_lua!{
		let sock = match sock {
			BoundSocket::Tcp(sock) => ListenSocket::Tcp(TcpListener::from_std(sock)?),
			#[cfg(unix)]
			BoundSocket::Unix(sock) => ListenSocket::Unix(UnixListener::from_std(sock)?),
			#[cfg(windows)]
			BoundSocket::Pipe{name, first} => ListenSocket::Pipe{name, pending: Some(first)},
		};
		ListenerWorker{
			rx,
			sock,
			tls_mode,
			server_cfg,
			stream_cfg,
			conns,
			handle: key,
		}.spawn()
	}
	Ok(v)
}

enum BoundSocket {
	Tcp(std::net::TcpListener),
	#[cfg(unix)]
	Unix(std::os::unix::net::UnixListener),
	#[cfg(windows)]
	Pipe{
		name: String,
		first: tokio::net::windows::named_pipe::NamedPipeServer,
	},
}
