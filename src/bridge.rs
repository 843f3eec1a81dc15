/*!
# Duplex bridge

Adapts a script-provided duplex object (anything with a `write` callable
and, optionally, a `close` callable) into the TLS machine. Inbound bytes
are pushed through the returned feed handle; outbound ciphertext is handed
back to the duplex's `write` from the dispatch loop, never reentrantly.
*/
use mlua::prelude::*;

use std::convert::TryFrom;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use tokio_rustls::rustls;

use crate::config::CONFIG;
use crate::core::{MAIN_CHANNEL, Message, Spawn, LuaRegistryHandle};
use crate::error::ArgError;
use crate::handlers::HandlerSet;
use crate::stream;
use crate::stream::{
	ControlMessage,
	DuplexIo,
	FdStream,
	Kind,
	SocketHandle,
	SocketState,
	StartTls,
	Stream,
	StreamWorker,
	TlsPhase,
	AddrStr,
	Shared,
};
use crate::tls;
use crate::with_runtime_lua;


/// Virtual transport: reads arrive from the script through an unbounded
/// channel, writes leave towards the script via the outbound forwarder.
struct VirtualStream {
	rx: mpsc::UnboundedReceiver<Option<Bytes>>,
	pending: Option<Bytes>,
	out: Option<mpsc::UnboundedSender<Bytes>>,
	eof: bool,
}

impl AsyncRead for VirtualStream {
	fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		let this = self.get_mut();
		loop {
			if let Some(mut chunk) = this.pending.take() {
				let n = chunk.len().min(buf.remaining());
				buf.put_slice(&chunk[..n]);
				chunk.advance(n);
				if !chunk.is_empty() {
					this.pending = Some(chunk);
				}
				return Poll::Ready(Ok(()));
			}
			if this.eof {
				return Poll::Ready(Ok(()));
			}
			match this.rx.poll_recv(cx) {
				Poll::Ready(Some(Some(chunk))) => {
					if chunk.is_empty() {
						continue;
					}
					this.pending = Some(chunk);
				},
				Poll::Ready(Some(None)) | Poll::Ready(None) => {
					this.eof = true;
					return Poll::Ready(Ok(()));
				},
				Poll::Pending => return Poll::Pending,
			}
		}
	}
}

impl AsyncWrite for VirtualStream {
	fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		let this = self.get_mut();
		match this.out.as_ref() {
			Some(out) => match out.send(Bytes::copy_from_slice(buf)) {
				Ok(()) => Poll::Ready(Ok(buf.len())),
				Err(_) => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "duplex stream closed"))),
			},
			None => Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "duplex stream closed"))),
		}
	}

	fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		Poll::Ready(Ok(()))
	}

	fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		// dropping the sender lets the forwarder deliver the deferred close
		self.get_mut().out = None;
		Poll::Ready(Ok(()))
	}
}

/// Hands ciphertext to the dispatch loop one chunk at a time; delivers the
/// deferred close once the transport is gone.
struct OutboundForwarder {
	rx: mpsc::UnboundedReceiver<Bytes>,
	handle: LuaRegistryHandle,
}

impl OutboundForwarder {
	async fn run(mut self) {
		while let Some(data) = self.rx.recv().await {
			match MAIN_CHANNEL.send(Message::DuplexWrite{
				handle: self.handle.clone(),
				data,
			}).await {
				Ok(_) => (),
				Err(_) => return,
			}
		}
		MAIN_CHANNEL.fire_and_forget(Message::DuplexClose{
			handle: self.handle.clone(),
		}).await;
	}
}

impl Spawn for OutboundForwarder {
	fn spawn(self) {
		tokio::spawn(async move { self.run().await });
	}
}

/**
Feed handle returned to the script: the inbound half of the virtual
transport.
*/
pub(crate) struct DuplexFeed {
	tx: mpsc::UnboundedSender<Option<Bytes>>,
}

impl LuaUserData for DuplexFeed {
	fn add_methods<'lua, M: LuaUserDataMethods<'lua, Self>>(methods: &mut M) {
		methods.add_method("push", |_, this: &Self, data: LuaString| -> LuaResult<bool> {
			Ok(this.tx.send(Some(Bytes::copy_from_slice(data.as_bytes()))).is_ok())
		});

		methods.add_method("finish", |_, this: &Self, _: ()| -> LuaResult<bool> {
			Ok(this.tx.send(None).is_ok())
		});
	}
}

/**
Run TLS over a script-provided duplex stream.

Returns `{tls_socket, feed}`: the script wires its stream's data events to
`feed:push(chunk)` / `feed:finish()` and receives outbound ciphertext via
`duplex.write(duplex, chunk)`.
*/
pub(crate) fn upgrade_duplex<'l>(
	lua: &'l Lua,
	(duplex, options): (LuaTable<'l>, LuaTable<'l>),
) -> LuaResult<LuaTable<'l>> {
	match duplex.raw_get::<_, LuaValue>("write")? {
		LuaValue::Function(_) => (),
		_ => return Err(ArgError::InvalidArguments("duplex object must carry a write function".into()).into()),
	}
	let callbacks = match options.get::<_, Option<LuaTable>>("socket")? {
		Some(v) => v,
		None => return Err(ArgError::InvalidArguments("socket callback record is required".into()).into()),
	};
	let tls_cfg = match stream::tls_option(&options)? {
		Some(cfg) => cfg,
		None => return Err(ArgError::InvalidArguments("tls config is required".into()).into()),
	};
	let binary_type = stream::parse_binary_type(&options)?;
	let default_data = options.get::<_, LuaValue>("data")?;
	let servername = options.get::<_, Option<String>>("servername")?;

	let (start, sessions, sni_text, is_server) = match tls_cfg {
		tls::TlsConfig::Server(parts) => (StartTls::Accept(parts), None, None, true),
		tls::TlsConfig::Client(parts) => {
			let text = match servername {
				Some(t) => t,
				None => return Err(ArgError::InvalidArguments("servername is required for TLS".into()).into()),
			};
			let name = rustls::ServerName::try_from(text.as_str()).map_err(|e| {
				LuaError::from(ArgError::InvalidArguments(format!("servername is not usable for TLS: {}", e)))
			})?;
			let sessions = parts.sessions.clone();
			(StartTls::Connect(name, parts), Some(sessions), Some(text), false)
		},
	};

	let stream_cfg = CONFIG.read().unwrap().stream;
	let handlers = HandlerSet::from_options(lua, callbacks, binary_type, is_server, None, Some(default_data.clone()))?;
	let shared = Shared::new(stream_cfg.write_hwm, false);

	let (in_tx, in_rx) = mpsc::unbounded_channel();
	let (out_tx, out_rx) = mpsc::unbounded_channel();
	let virtual_stream = VirtualStream{
		rx: in_rx,
		pending: None,
		out: Some(out_tx),
		eof: false,
	};

	let (mut handle, rx) = SocketHandle::new(
		SocketState::Open(TlsPhase::Handshaking),
		Kind::Client,
		AddrStr::Unspecified,
		AddrStr::Unspecified,
		shared.clone(),
		handlers,
	);
	handle.sessions = sessions;
	handle.servername = sni_text;
	let (ud, key) = SocketHandle::create(lua, handle, default_data)?;
	ud.get_user_value::<LuaTable>()?.raw_set("_duplex", duplex)?;

	// the handshake is queued before the worker spawns: it runs on the
	// next tick relative to this call
	{
		let h = ud.borrow::<SocketHandle>()?;
		h.tx.send(ControlMessage::StartTls(start, None)).ok();
	}

	with_runtime_lua!{
		let conn = FdStream::virtual_stream(Stream::from(Box::new(virtual_stream) as Box<dyn DuplexIo>));
		StreamWorker::new(rx, conn, stream_cfg, shared, key.clone()).spawn();
		OutboundForwarder{
			rx: out_rx,
			handle: key,
		}.spawn()
	}

	let feed = lua.create_userdata(DuplexFeed{tx: in_tx})?;
	let result = lua.create_table_with_capacity(2, 0)?;
	result.raw_set(1, ud)?;
	result.raw_set(2, feed)?;
	Ok(result)
}
