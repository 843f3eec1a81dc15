/*!
# Stream socket implementation

This module provides a handle/worker pair for a stream-based network
connection: TCP, Unix sockets, adopted descriptors, named pipes and
script-provided duplex transports all route through the same engine.

Related modules:

- [`crate::listener`] which handles listening sockets.
- [`crate::wrap`] which layers TLS over an already-open engine.
- [`crate::bridge`] which adapts script duplex objects into the engine.
*/

mod connect;
mod handle;
mod lua;
mod msg;
mod state;
mod worker;

pub(crate) use handle::{
	AddrStr,
	Kind,
	SocketHandle,
	WrapMode,
};

pub(crate) use msg::{
	ControlMessage,
	StartTls,
};

pub(crate) use state::{
	PreTlsConfig,
	SocketState,
	TlsPhase,
};

pub(crate) use worker::{
	DuplexIo,
	FdStream,
	Shared,
	Stream,
	StreamWorker,
};

pub(crate) use lua::{
	connect,
	parse_binary_type,
	tls_option,
	wrapfd,
};
