use mlua::prelude::*;

use std::borrow::Cow;
use std::convert::TryFrom;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;

use tokio::sync::mpsc;

use tokio_rustls::rustls;

use crate::cert;
use crate::conversion::opaque;
use crate::core;
use crate::core::LuaRegistryHandle;
use crate::error::ArgError;
use crate::handlers::HandlerSet;
use crate::tls;

use super::msg::{
	ControlMessage,
	SocketOption,
};
use super::state::{
	PreTlsConfig,
	SocketState,
};
use super::worker::Shared;


#[derive(Clone)]
pub(crate) enum AddrStr {
	Unspecified,
	InetAny{
		addr: String,
		port: u16,
	},
	Unix{
		path: String,
	},
	Pipe{
		name: String,
	},
}

impl AddrStr {
	pub(crate) fn addr(&self) -> Option<&str> {
		match self {
			Self::Unspecified => None,
			Self::InetAny{addr, ..} => Some(&addr),
			Self::Unix{path} => Some(&path),
			Self::Pipe{name} => Some(&name),
		}
	}

	pub(crate) fn port(&self) -> Option<u16> {
		match self {
			Self::InetAny{port, ..} => Some(*port),
			_ => None,
		}
	}

	pub(crate) fn is_pipe(&self) -> bool {
		matches!(self, Self::Pipe{..})
	}
}

impl fmt::Debug for AddrStr {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Unspecified => f.write_str("<unspecified>"),
			Self::InetAny{addr, port} => write!(f, "{}:{}", addr, port),
			Self::Unix{path} => f.write_str(path),
			Self::Pipe{name} => f.write_str(name),
		}
	}
}

impl From<SocketAddr> for AddrStr {
	fn from(other: SocketAddr) -> Self {
		Self::InetAny{
			addr: other.ip().to_string(),
			port: other.port(),
		}
	}
}

#[cfg(unix)]
impl From<std::os::unix::net::SocketAddr> for AddrStr {
	fn from(other: std::os::unix::net::SocketAddr) -> Self {
		match other.as_pathname() {
			Some(v) => Self::Unix{
				path: v.to_string_lossy().into(),
			},
			None => Self::Unspecified,
		}
	}
}

#[cfg(unix)]
impl From<tokio::net::unix::SocketAddr> for AddrStr {
	fn from(other: tokio::net::unix::SocketAddr) -> Self {
		match other.as_pathname() {
			Some(v) => Self::Unix{
				path: v.to_string_lossy().into(),
			},
			None => Self::Unspecified,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
	Server,
	Client,
}

/// Which logical face of a wrap pair this handle represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WrapMode {
	None,
	TlsFace,
	TcpFace,
}

/// Native consumer which takes the byte stream instead of the script's
/// `data` callback (protocol upgrades handled outside the script).
pub(crate) type NativeHook = Box<dyn FnMut(&Lua, &Bytes) -> LuaResult<()> + 'static>;

pub(crate) struct SocketHandle {
	pub(crate) tx: mpsc::UnboundedSender<ControlMessage>,
	pub(crate) state: SocketState,
	pub(crate) kind: Kind,
	pub(crate) local: AddrStr,
	pub(crate) remote: AddrStr,
	pub(crate) shared: Arc<Shared>,
	pub(crate) handlers: Arc<HandlerSet>,
	pub(crate) wrap: WrapMode,
	pub(crate) sibling: Option<LuaRegistryHandle>,
	pub(crate) sessions: Option<Arc<tls::RecordingSessionStore>>,
	pub(crate) servername: Option<String>,
	pub(crate) open_fired: bool,
	pub(crate) promise_settled: bool,
	pub(crate) allow_half_open: bool,
	pub(crate) tls_pending: bool,
	pub(crate) active: bool,
	pub(crate) keepalive: bool,
	pub(crate) detached: bool,
	pub(crate) torn_down: bool,
	pub(crate) hook: Option<NativeHook>,
}

impl SocketHandle {
	pub(crate) fn new(
		state: SocketState,
		kind: Kind,
		local: AddrStr,
		remote: AddrStr,
		shared: Arc<Shared>,
		handlers: Arc<HandlerSet>,
	) -> (Self, mpsc::UnboundedReceiver<ControlMessage>) {
		let (tx, rx) = mpsc::unbounded_channel();
		handlers.mark_active();
		core::keepalive_acquire();
		(Self{
			tx,
			state,
			kind,
			local,
			remote,
			shared,
			handlers,
			wrap: WrapMode::None,
			sibling: None,
			sessions: None,
			servername: None,
			open_fired: false,
			promise_settled: false,
			allow_half_open: false,
			tls_pending: false,
			active: true,
			keepalive: true,
			detached: false,
			torn_down: false,
			hook: None,
		}, rx)
	}

	/// A handle sharing an existing worker's control channel: one face of a
	/// wrap pair. `hold_keepalive` is set on exactly one face so the pair
	/// shares a single loop ref.
	pub(crate) fn attached(
		tx: mpsc::UnboundedSender<ControlMessage>,
		state: SocketState,
		kind: Kind,
		local: AddrStr,
		remote: AddrStr,
		shared: Arc<Shared>,
		handlers: Arc<HandlerSet>,
		hold_keepalive: bool,
	) -> Self {
		handlers.mark_active();
		if hold_keepalive {
			core::keepalive_acquire();
		}
		Self{
			tx,
			state,
			kind,
			local,
			remote,
			shared,
			handlers,
			wrap: WrapMode::None,
			sibling: None,
			sessions: None,
			servername: None,
			open_fired: false,
			promise_settled: true,
			allow_half_open: false,
			tls_pending: false,
			active: true,
			keepalive: hold_keepalive,
			detached: false,
			torn_down: false,
			hook: None,
		}
	}

	/// Root the handle in the registry with its script-data table.
	pub(crate) fn create<'l>(
		lua: &'l Lua,
		handle: SocketHandle,
		data: LuaValue<'l>,
	) -> LuaResult<(LuaAnyUserData<'l>, LuaRegistryHandle)> {
		let ud = lua.create_userdata(handle)?;
		let tbl = lua.create_table()?;
		tbl.raw_set("data", data)?;
		ud.set_user_value(tbl)?;
		let key: LuaRegistryHandle = lua.create_registry_value(ud.clone())?.into();
		Ok((ud, key))
	}

	/// Release all accounting exactly once; returns whether this call did
	/// the release.
	pub(crate) fn teardown(&mut self) -> bool {
		if self.torn_down {
			return false;
		}
		self.torn_down = true;
		self.active = false;
		self.detached = true;
		let _ = self.state.closed();
		self.shared.writable.store(false, Ordering::SeqCst);
		self.handlers.mark_inactive();
		if self.keepalive {
			core::keepalive_release();
			self.keepalive = false;
		}
		true
	}

	/// Detach without closing the transport: the engine hands its transport
	/// over to a wrap pair.
	pub(crate) fn detach_for_upgrade(&mut self) {
		if self.torn_down {
			return;
		}
		self.torn_down = true;
		self.active = false;
		self.detached = true;
		self.state = SocketState::Detached;
		self.handlers.mark_inactive();
		if self.keepalive {
			core::keepalive_release();
			self.keepalive = false;
		}
	}

	fn writable(&self) -> bool {
		!self.detached && self.shared.writable.load(Ordering::SeqCst)
	}

	/// Accept up to the high-water mark; the remainder is not staged.
	/// Returns the accepted count, -1 once shut down or closed.
	fn accept_write(&self, payload: &[u8]) -> i64 {
		if !self.writable() {
			return -1;
		}
		if payload.is_empty() {
			// empty TLS record semantics; plain TCP ignores it
			if self.shared.tls_started.load(Ordering::SeqCst) {
				let _ = self.tx.send(ControlMessage::WriteEmptyTls);
			}
			return 0;
		}
		let hwm = self.shared.hwm.load(Ordering::SeqCst);
		let room = hwm.saturating_sub(self.shared.pending());
		let accepted = room.min(payload.len());
		if accepted < payload.len() {
			self.shared.want_drain.store(true, Ordering::SeqCst);
		}
		if accepted > 0 {
			self.shared.queued.fetch_add(accepted, Ordering::SeqCst);
			self.shared.bytes_written.fetch_add(accepted as u64, Ordering::SeqCst);
			if self.tx.send(ControlMessage::Write{
				data: Bytes::copy_from_slice(&payload[..accepted]),
				staged: false,
			}).is_err() {
				self.shared.writable.store(false, Ordering::SeqCst);
				return -1;
			}
		}
		accepted as i64
	}

	/// Stage bytes into the backlog regardless of the high-water mark.
	fn stage_write(&self, payload: &[u8]) -> bool {
		if payload.is_empty() {
			return true;
		}
		self.shared.want_drain.store(true, Ordering::SeqCst);
		self.shared.queued.fetch_add(payload.len(), Ordering::SeqCst);
		self.shared.staged.fetch_add(payload.len(), Ordering::SeqCst);
		if self.tx.send(ControlMessage::Write{
			data: Bytes::copy_from_slice(payload),
			staged: true,
		}).is_err() {
			self.shared.writable.store(false, Ordering::SeqCst);
			return false;
		}
		true
	}

	pub(crate) fn tls_info(&self) -> Option<&tls::Info> {
		self.state.tls_info()
	}

	fn peer_certificate(&self) -> Option<cert::ParsedCertificate> {
		let info = self.tls_info()?;
		let der = match info.verify.peer_cert() {
			Some(cert) => &cert.0,
			None => &info.peer_certs.first()?.0,
		};
		cert::ParsedCertificate::from_der(Cow::Borrowed(der)).ok()
	}

	fn local_certificate(&self) -> Option<cert::ParsedCertificate> {
		let info = self.tls_info()?;
		let der = &info.local_certs.as_ref()?.first()?.0;
		cert::ParsedCertificate::from_der(Cow::Borrowed(der)).ok()
	}
}

/// Parse the `(data[, offset[, length]][, encoding])` write arguments into
/// the actual byte window. An encoding tag combined with a window is
/// rejected; the recognised tags are identity transforms on Lua strings.
fn parse_write_payload<'l>(
	data: &LuaString<'l>,
	a: Option<LuaValue<'l>>,
	b: Option<LuaValue<'l>>,
	c: Option<LuaValue<'l>>,
) -> Result<Bytes, ArgError> {
	let mut offset: Option<i64> = None;
	let mut length: Option<i64> = None;
	let mut encoding: Option<String> = None;

	for arg in [a, b, c] {
		match arg {
			None | Some(LuaValue::Nil) => (),
			Some(LuaValue::Integer(n)) => {
				if offset.is_none() {
					offset = Some(n);
				} else if length.is_none() {
					length = Some(n);
				} else {
					return Err(ArgError::InvalidArguments("too many numeric arguments".into()));
				}
			},
			Some(LuaValue::Number(n)) if n.fract() == 0.0 => {
				if offset.is_none() {
					offset = Some(n as i64);
				} else if length.is_none() {
					length = Some(n as i64);
				} else {
					return Err(ArgError::InvalidArguments("too many numeric arguments".into()));
				}
			},
			Some(LuaValue::String(s)) => {
				if encoding.is_some() {
					return Err(ArgError::InvalidArguments("duplicate encoding argument".into()));
				}
				encoding = Some(s.to_str().map_err(|_| {
					ArgError::InvalidArguments("encoding must be a valid string".into())
				})?.to_string());
			},
			Some(other) => {
				return Err(ArgError::InvalidArguments(format!(
					"unexpected write argument of type {}",
					other.type_name()
				)));
			},
		}
	}

	if encoding.is_some() && (offset.is_some() || length.is_some()) {
		return Err(ArgError::InvalidArguments(
			"encoding cannot be combined with offset/length".into(),
		));
	}
	if let Some(enc) = &encoding {
		match enc.as_str() {
			"utf8" | "utf-8" | "ascii" | "latin1" | "binary" | "buffer" => (),
			_ => return Err(ArgError::InvalidArguments(format!("unknown encoding: {:?}", enc))),
		}
	}

	let bytes = data.as_bytes();
	let offset = offset.unwrap_or(0);
	if offset < 0 || offset as usize > bytes.len() {
		return Err(ArgError::InvalidArguments(format!("offset out of bounds: {}", offset)));
	}
	let offset = offset as usize;
	let length = match length {
		Some(l) => {
			if l < 0 || offset + l as usize > bytes.len() {
				return Err(ArgError::InvalidArguments(format!("length out of bounds: {}", l)));
			}
			l as usize
		},
		None => bytes.len() - offset,
	};
	Ok(Bytes::copy_from_slice(&bytes[offset..offset + length]))
}

impl LuaUserData for SocketHandle {
	fn add_methods<'lua, M: LuaUserDataMethods<'lua, Self>>(methods: &mut M) {
		methods.add_method("ip", |_, this: &Self, _: ()| -> LuaResult<Option<String>> {
			let addr = match this.kind {
				Kind::Server => this.local.addr(),
				Kind::Client => this.remote.addr(),
			}.map(|x| { x.to_string() });
			Ok(addr)
		});

		methods.add_method("port", |_, this: &Self, _: ()| -> LuaResult<Option<u16>> {
			match this.kind {
				Kind::Server => Ok(this.local.port()),
				Kind::Client => Ok(this.remote.port()),
			}
		});

		methods.add_method("clientport", |_, this: &Self, _: ()| -> LuaResult<Option<u16>> {
			match this.kind {
				Kind::Server => Ok(this.remote.port()),
				Kind::Client => Ok(this.local.port()),
			}
		});

		methods.add_method("serverport", |_, this: &Self, _: ()| -> LuaResult<Option<u16>> {
			match this.kind {
				Kind::Server => Ok(this.local.port()),
				Kind::Client => Ok(this.remote.port()),
			}
		});

		methods.add_method("write", |_, this: &Self, (data, a, b, c): (LuaString, Option<LuaValue>, Option<LuaValue>, Option<LuaValue>)| -> LuaResult<i64> {
			let payload = parse_write_payload(&data, a, b, c)?;
			Ok(this.accept_write(&payload))
		});

		methods.add_method("writebuffered", |_, this: &Self, (data, a, b, c): (LuaString, Option<LuaValue>, Option<LuaValue>, Option<LuaValue>)| -> LuaResult<bool> {
			let payload = parse_write_payload(&data, a, b, c)?;
			let accepted = this.accept_write(&payload);
			if accepted < 0 {
				return Ok(false);
			}
			let accepted = accepted as usize;
			if accepted < payload.len() {
				this.stage_write(&payload[accepted..]);
				return Ok(false);
			}
			Ok(true)
		});

		methods.add_method("finish", |_, this: &Self, (data, a, b, c): (Option<LuaString>, Option<LuaValue>, Option<LuaValue>, Option<LuaValue>)| -> LuaResult<i64> {
			if !this.writable() {
				return Ok(-1);
			}
			let payload = match &data {
				Some(data) => Some(parse_write_payload(data, a, b, c)?),
				None => None,
			};
			let len = payload.as_ref().map(|p| p.len()).unwrap_or(0);
			if let Some(payload) = &payload {
				if !payload.is_empty() {
					this.shared.queued.fetch_add(payload.len(), Ordering::SeqCst);
					this.shared.staged.fetch_add(payload.len(), Ordering::SeqCst);
				}
			}
			this.shared.writable.store(false, Ordering::SeqCst);
			match this.tx.send(ControlMessage::End(payload.filter(|p| !p.is_empty()))) {
				Ok(()) => Ok(len as i64),
				Err(_) => Ok(-1),
			}
		});

		methods.add_method("shutdown", |_, this: &Self, read_only: Option<bool>| -> LuaResult<()> {
			let _ = this.tx.send(ControlMessage::Shutdown{read_only: read_only.unwrap_or(false)});
			Ok(())
		});

		methods.add_method("close", |_, this: &Self, _: ()| -> LuaResult<()> {
			// this can only fail when the socket is already dead
			let _ = this.tx.send(ControlMessage::Close);
			Ok(())
		});

		methods.add_method("terminate", |_, this: &Self, _: ()| -> LuaResult<()> {
			let _ = this.tx.send(ControlMessage::Terminate);
			Ok(())
		});

		methods.add_method("pause", |_, this: &Self, _: ()| -> LuaResult<()> {
			if this.wrap != WrapMode::None {
				return Err(ArgError::InvalidState("a wrapped pair shares one read queue and cannot pause").into());
			}
			let _ = this.tx.send(ControlMessage::PauseReads);
			Ok(())
		});

		methods.add_method("resume", |_, this: &Self, _: ()| -> LuaResult<()> {
			if this.wrap != WrapMode::None {
				return Err(ArgError::InvalidState("a wrapped pair shares one read queue and cannot pause").into());
			}
			let _ = this.tx.send(ControlMessage::ResumeReads);
			Ok(())
		});

		methods.add_method("settimeout", |_, this: &Self, seconds: f64| -> LuaResult<()> {
			if !seconds.is_finite() || seconds < 0.0 {
				return Err(ArgError::InvalidArguments(format!("invalid timeout: {}", seconds)).into());
			}
			let _ = this.tx.send(ControlMessage::SetIdleTimeout(Duration::from_secs_f64(seconds)));
			Ok(())
		});

		methods.add_method("setoption", |lua, this: &Self, name: String| -> LuaResult<(bool, Option<String>)> {
			let option = match SocketOption::from_lua_args(lua, name, LuaValue::Nil) {
				Ok(v) => v,
				Err(e) => return Ok((false, Some(e))),
			};
			let _ = this.tx.send(ControlMessage::SetOption(option));
			Ok((true, None))
		});

		methods.add_method_mut("ref", |_, this: &mut Self, _: ()| -> LuaResult<()> {
			if !this.keepalive && !this.torn_down {
				core::keepalive_acquire();
				this.keepalive = true;
			}
			Ok(())
		});

		methods.add_method_mut("unref", |_, this: &mut Self, _: ()| -> LuaResult<()> {
			if this.keepalive {
				core::keepalive_release();
				this.keepalive = false;
			}
			Ok(())
		});

		methods.add_method("byteswritten", |_, this: &Self, _: ()| -> LuaResult<u64> {
			Ok(this.shared.bytes_written.load(Ordering::SeqCst))
		});

		methods.add_method("backlog", |_, this: &Self, _: ()| -> LuaResult<usize> {
			Ok(this.shared.backlog())
		});

		methods.add_method("pendingbytes", |_, this: &Self, _: ()| -> LuaResult<usize> {
			Ok(this.shared.pending())
		});

		methods.add_method("active", |_, this: &Self, _: ()| -> LuaResult<bool> {
			Ok(this.active)
		});

		methods.add_method("ssl", |_, this: &Self, _: ()| -> LuaResult<bool> {
			Ok(this.tls_info().is_some())
		});

		methods.add_method("ssl_info", |lua, this: &Self, _: ()| -> LuaResult<Option<LuaTable>> {
			match this.tls_info() {
				Some(info) => Ok(Some(info.to_lua_table(lua)?)),
				None => Ok(None),
			}
		});

		methods.add_method("alpn_protocol", |lua, this: &Self, _: ()| -> LuaResult<LuaValue> {
			match this.tls_info().and_then(|info| info.alpn.as_ref()) {
				Some(proto) => Ok(LuaValue::String(lua.create_string(proto)?)),
				None => Ok(LuaValue::Boolean(false)),
			}
		});

		methods.add_method("cipher", |lua, this: &Self, _: ()| -> LuaResult<Option<LuaTable>> {
			let info = match this.tls_info() {
				Some(info) => info,
				None => return Ok(None),
			};
			let tbl = lua.create_table_with_capacity(0, 3)?;
			if let Some(name) = info.cipher_name() {
				tbl.raw_set("name", name.as_str())?;
				tbl.raw_set("standardName", name.as_str())?;
			}
			if let Some(version) = info.cipher_protocol_name() {
				tbl.raw_set("version", version)?;
			}
			Ok(Some(tbl))
		});

		methods.add_method("tls_version", |_, this: &Self, _: ()| -> LuaResult<Option<&'static str>> {
			Ok(this.tls_info().map(|info| info.protocol_name()))
		});

		methods.add_method("servername", |_, this: &Self, _: ()| -> LuaResult<Option<String>> {
			match this.tls_info().and_then(|info| info.server_name.clone()) {
				Some(name) => Ok(Some(name)),
				None => Ok(this.servername.clone()),
			}
		});

		methods.add_method_mut("set_servername", |_, this: &mut Self, name: String| -> LuaResult<()> {
			let parsed = rustls::ServerName::try_from(name.as_str()).map_err(|e| {
				LuaError::from(ArgError::InvalidArguments(format!("invalid server name: {}", e)))
			})?;
			this.state.set_servername(parsed).map_err(|e| opaque(format!("{}", e)))?;
			this.servername = Some(name);
			Ok(())
		});

		methods.add_method("ssl_peercertificate", |lua, this: &Self, abbrev: Option<bool>| -> LuaResult<LuaValue> {
			match this.peer_certificate() {
				Some(parsed) => {
					if abbrev.unwrap_or(false) {
						Ok(LuaValue::Table(parsed.abbreviated(lua)?))
					} else {
						Ok(LuaValue::UserData(lua.create_userdata(parsed)?))
					}
				},
				None => Ok(LuaValue::Nil),
			}
		});

		methods.add_method("ssl_certificate", |lua, this: &Self, abbrev: Option<bool>| -> LuaResult<LuaValue> {
			match this.local_certificate() {
				Some(parsed) => {
					if abbrev.unwrap_or(false) {
						Ok(LuaValue::Table(parsed.abbreviated(lua)?))
					} else {
						Ok(LuaValue::UserData(lua.create_userdata(parsed)?))
					}
				},
				None => Ok(LuaValue::Nil),
			}
		});

		methods.add_method("ssl_peerverification", |lua, this: &Self, _: ()| -> LuaResult<(bool, LuaTable)> {
			let reasons = lua.create_table()?;
			match this.tls_info() {
				Some(info) => {
					if info.verify.authorized() {
						Ok((true, reasons))
					} else {
						match info.verify.error_text() {
							Some(text) => reasons.raw_set(1, text)?,
							None => reasons.raw_set(1, "verification disabled or did not complete")?,
						};
						Ok((false, reasons))
					}
				},
				None => {
					reasons.raw_set(1, "no TLS established")?;
					Ok((false, reasons))
				},
			}
		});

		methods.add_method("session", |lua, this: &Self, _: ()| -> LuaResult<Option<LuaString>> {
			match this.sessions.as_ref().and_then(|s| s.last_session()) {
				Some(blob) => Ok(Some(lua.create_string(&blob)?)),
				None => Ok(None),
			}
		});

		methods.add_method("set_session", |_, this: &Self, blob: LuaString| -> LuaResult<bool> {
			match this.sessions.as_ref() {
				Some(sessions) => {
					sessions.inject(blob.as_bytes().to_vec());
					Ok(true)
				},
				None => Ok(false),
			}
		});

		methods.add_method("tls_ticket", |lua, this: &Self, _: ()| -> LuaResult<Option<LuaString>> {
			match this.sessions.as_ref().and_then(|s| s.last_session()) {
				Some(blob) => Ok(Some(lua.create_string(&blob)?)),
				None => Ok(None),
			}
		});

		methods.add_method("finished_message", |_, _this: &Self, _: ()| -> LuaResult<LuaValue> {
			// not exposed by the TLS backend
			Ok(LuaValue::Nil)
		});

		methods.add_method("peer_finished_message", |_, _this: &Self, _: ()| -> LuaResult<LuaValue> {
			// not exposed by the TLS backend
			Ok(LuaValue::Nil)
		});

		methods.add_method("shared_sigalgs", |lua, _this: &Self, _: ()| -> LuaResult<LuaTable> {
			// not exposed by the TLS backend
			lua.create_table()
		});

		methods.add_method("ephemeral_key_info", |_, _this: &Self, _: ()| -> LuaResult<LuaValue> {
			// not exposed by the TLS backend
			Ok(LuaValue::Nil)
		});

		methods.add_method("export_keying_material", |lua, this: &Self, (len, label, context): (usize, LuaString, Option<LuaString>)| -> LuaResult<LuaString> {
			if len == 0 {
				return Err(ArgError::InvalidArguments("length must be positive".into()).into());
			}
			if this.tls_info().is_none() {
				return Err(ArgError::InvalidState("keying material requires an established TLS connection").into());
			}
			let (reply_tx, reply_rx) = std::sync::mpsc::sync_channel(1);
			this.tx.send(ControlMessage::ExportKeyingMaterial{
				len,
				label: label.as_bytes().to_vec(),
				context: context.map(|c| c.as_bytes().to_vec()),
				reply: reply_tx,
			}).map_err(|_| opaque("socket already closed"))?;
			match reply_rx.recv_timeout(Duration::from_secs(5)) {
				Ok(Ok(material)) => lua.create_string(&material),
				Ok(Err(e)) => Err(opaque(e)),
				Err(_) => Err(opaque("timed out waiting for keying material")),
			}
		});

		methods.add_method("set_max_send_fragment", |_, this: &Self, size: i64| -> LuaResult<bool> {
			if size < 512 || size > 16384 {
				return Err(ArgError::InvalidArguments(format!("fragment size out of range: {}", size)).into());
			}
			this.shared.write_cap.store(size as usize, Ordering::SeqCst);
			Ok(true)
		});

		methods.add_method("set_verify_mode", |_, this: &Self, (request_cert, reject_unauthorized): (bool, bool)| -> LuaResult<()> {
			if this.shared.tls_started.load(Ordering::SeqCst) {
				return Err(ArgError::InvalidState("verification mode cannot change after the handshake started").into());
			}
			match this.state.pre_tls() {
				Some(PreTlsConfig::Client(_, parts)) => {
					parts.recorder.set_strict(reject_unauthorized);
					Ok(())
				},
				Some(PreTlsConfig::Server(parts)) => {
					parts.recorder.set_mode(request_cert, reject_unauthorized);
					Ok(())
				},
				Some(PreTlsConfig::None) | None => {
					Err(ArgError::InvalidState("no TLS context associated with this socket").into())
				},
			}
		});

		methods.add_method("renegotiate", |_, _this: &Self, _: ()| -> LuaResult<()> {
			Err(opaque("renegotiation is not supported by the TLS backend"))
		});

		methods.add_method("disable_renegotiation", |_, _this: &Self, _: ()| -> LuaResult<bool> {
			// the backend never renegotiates
			Ok(true)
		});

		methods.add_meta_function(LuaMetaMethod::Index, |_, (this, key): (LuaAnyUserData, LuaString)| -> LuaResult<LuaValue> {
			let data = this.get_user_value::<LuaTable>()?;
			data.raw_get::<_, LuaValue>(key)
		});

		methods.add_meta_function(LuaMetaMethod::NewIndex, |_, (this, key, value): (LuaAnyUserData, LuaString, LuaValue)| -> LuaResult<()> {
			let data = this.get_user_value::<LuaTable>()?;
			data.raw_set(key, value)
		});
	}
}

impl Drop for SocketHandle {
	fn drop(&mut self) {
		if !self.torn_down {
			// the script wrapper is being collected while the engine is
			// still live; the worker must not call back into the runtime
			self.shared.finalizing.store(true, Ordering::SeqCst);
			let _ = self.tx.send(ControlMessage::Terminate);
			self.handlers.mark_inactive();
			if self.keepalive {
				core::keepalive_release();
				self.keepalive = false;
			}
		}
	}
}
