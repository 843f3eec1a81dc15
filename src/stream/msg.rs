use std::time::Duration;

use bytes::Bytes;

use tokio_rustls::rustls;

use crate::core::LuaRegistryHandle;
use crate::tls;


pub(crate) enum SocketOption {
	KeepAlive(bool),
}

/// Instruction for the worker to layer TLS over the live transport.
pub(crate) enum StartTls {
	Accept(tls::ServerTls),
	Connect(rustls::ServerName, tls::ClientTls),
}

impl StartTls {
	pub(crate) fn local_certs(&self) -> Option<Vec<rustls::Certificate>> {
		match self {
			Self::Accept(parts) => parts.resolver.default_certs(),
			Self::Connect(_, parts) => parts.local_certs.clone(),
		}
	}
}

pub(crate) enum ControlMessage {
	/// Flush the backlog, shut the transport down, report disconnect.
	Close,

	/// Hard abort: the backlog is dropped, nothing is flushed.
	Terminate,

	/// Half-close one direction; idempotent.
	Shutdown{
		read_only: bool,
	},

	/// Stop delivering inbound bytes until resumed.
	PauseReads,
	ResumeReads,

	/// Accepted payload bytes. `staged` marks bytes beyond the high-water
	/// mark which entered the backlog via `writebuffered`/`finish`.
	Write{
		data: Bytes,
		staged: bool,
	},

	/// Zero-length write on a TLS socket: emit a deferred empty record once
	/// the handshake is complete and the backlog has drained.
	WriteEmptyTls,

	/// Final bytes plus end-after-flush: shut the write side down once the
	/// backlog is empty and no empty record is pending.
	End(Option<Bytes>),

	SetOption(SocketOption),

	/// Per-socket inactivity interval override.
	SetIdleTimeout(Duration),

	/// Begin a TLS handshake on the live transport. The optional handle
	/// replaces the worker's dispatch target first (wrap pairs route events
	/// to the TLS face).
	StartTls(StartTls, Option<LuaRegistryHandle>),

	/// Live introspection: RFC 5705 keying material export.
	ExportKeyingMaterial{
		len: usize,
		label: Vec<u8>,
		context: Option<Vec<u8>>,
		reply: std::sync::mpsc::SyncSender<Result<Vec<u8>, String>>,
	},
}
