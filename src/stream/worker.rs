use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::io::{AsRawFd, RawFd};

use pin_utils::pin_mut;

use bytes::{Buf, BufMut, Bytes, BytesMut, buf::Limit};

use tokio::select;
use tokio::io::{
	AsyncRead,
	AsyncReadExt,
	AsyncWrite,
	AsyncWriteExt,
	ReadBuf,
	ReadHalf,
	WriteHalf,
};
use tokio::net::TcpStream;
use tokio::net::tcp;
#[cfg(unix)]
use tokio::net::UnixStream;
#[cfg(unix)]
use tokio::net::unix;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout_at;

use tokio_rustls::{
	TlsAcceptor,
	TlsConnector,
	server,
	client,
	rustls,
};

use crate::config;
use crate::conversion::opaque;
use crate::core::{
	MAIN_CHANNEL,
	Message,
	Spawn,
	LuaRegistryHandle,
};
use crate::ioutil::{
	iotimeout,
	iodeadline,
};
use crate::tls;
use crate::verify;

use super::msg::{
	ControlMessage,
	SocketOption,
	StartTls,
};


/// Transport trait for streams which do not get a dedicated enum variant:
/// duplex bridges and named pipes travel boxed.
pub(crate) trait DuplexIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexIo for T {}


pub(crate) enum Stream {
	Broken{e: Option<Box<dyn std::error::Error + Send + 'static>>},
	PlainTcp{
		rx: tcp::OwnedReadHalf,
		tx: tcp::OwnedWriteHalf,
	},
	#[cfg(unix)]
	PlainUnix{
		rx: unix::OwnedReadHalf,
		tx: unix::OwnedWriteHalf,
	},
	TlsTcpServer{
		rx: ReadHalf<server::TlsStream<TcpStream>>,
		tx: WriteHalf<server::TlsStream<TcpStream>>,
	},
	TlsTcpClient{
		rx: ReadHalf<client::TlsStream<TcpStream>>,
		tx: WriteHalf<client::TlsStream<TcpStream>>,
	},
	#[cfg(unix)]
	TlsUnixServer{
		rx: ReadHalf<server::TlsStream<UnixStream>>,
		tx: WriteHalf<server::TlsStream<UnixStream>>,
	},
	#[cfg(unix)]
	TlsUnixClient{
		rx: ReadHalf<client::TlsStream<UnixStream>>,
		tx: WriteHalf<client::TlsStream<UnixStream>>,
	},
	PlainDyn{
		rx: ReadHalf<Box<dyn DuplexIo>>,
		tx: WriteHalf<Box<dyn DuplexIo>>,
	},
	TlsDynServer{
		rx: ReadHalf<server::TlsStream<Box<dyn DuplexIo>>>,
		tx: WriteHalf<server::TlsStream<Box<dyn DuplexIo>>>,
	},
	TlsDynClient{
		rx: ReadHalf<client::TlsStream<Box<dyn DuplexIo>>>,
		tx: WriteHalf<client::TlsStream<Box<dyn DuplexIo>>>,
	},
}

impl From<TcpStream> for Stream {
	fn from(other: TcpStream) -> Self {
		let (rx, tx) = other.into_split();
		Self::PlainTcp{rx, tx}
	}
}

#[cfg(unix)]
impl From<UnixStream> for Stream {
	fn from(other: UnixStream) -> Self {
		let (rx, tx) = other.into_split();
		Self::PlainUnix{rx, tx}
	}
}

impl From<server::TlsStream<TcpStream>> for Stream {
	fn from(other: server::TlsStream<TcpStream>) -> Self {
		let (rx, tx) = tokio::io::split(other);
		Self::TlsTcpServer{rx, tx}
	}
}

impl From<client::TlsStream<TcpStream>> for Stream {
	fn from(other: client::TlsStream<TcpStream>) -> Self {
		let (rx, tx) = tokio::io::split(other);
		Self::TlsTcpClient{rx, tx}
	}
}

#[cfg(unix)]
impl From<server::TlsStream<UnixStream>> for Stream {
	fn from(other: server::TlsStream<UnixStream>) -> Self {
		let (rx, tx) = tokio::io::split(other);
		Self::TlsUnixServer{rx, tx}
	}
}

#[cfg(unix)]
impl From<client::TlsStream<UnixStream>> for Stream {
	fn from(other: client::TlsStream<UnixStream>) -> Self {
		let (rx, tx) = tokio::io::split(other);
		Self::TlsUnixClient{rx, tx}
	}
}

impl From<Box<dyn DuplexIo>> for Stream {
	fn from(other: Box<dyn DuplexIo>) -> Self {
		let (rx, tx) = tokio::io::split(other);
		Self::PlainDyn{rx, tx}
	}
}

impl From<server::TlsStream<Box<dyn DuplexIo>>> for Stream {
	fn from(other: server::TlsStream<Box<dyn DuplexIo>>) -> Self {
		let (rx, tx) = tokio::io::split(other);
		Self::TlsDynServer{rx, tx}
	}
}

impl From<client::TlsStream<Box<dyn DuplexIo>>> for Stream {
	fn from(other: client::TlsStream<Box<dyn DuplexIo>>) -> Self {
		let (rx, tx) = tokio::io::split(other);
		Self::TlsDynClient{rx, tx}
	}
}

impl fmt::Debug for Stream {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::Broken{e} => f.debug_struct("Stream::Broken").field("e", &e).finish(),
			Self::PlainTcp{..} => f.debug_struct("Stream::PlainTcp").finish_non_exhaustive(),
			#[cfg(unix)]
			Self::PlainUnix{..} => f.debug_struct("Stream::PlainUnix").finish_non_exhaustive(),
			Self::TlsTcpServer{..} => f.debug_struct("Stream::TlsTcpServer").finish_non_exhaustive(),
			Self::TlsTcpClient{..} => f.debug_struct("Stream::TlsTcpClient").finish_non_exhaustive(),
			#[cfg(unix)]
			Self::TlsUnixServer{..} => f.debug_struct("Stream::TlsUnixServer").finish_non_exhaustive(),
			#[cfg(unix)]
			Self::TlsUnixClient{..} => f.debug_struct("Stream::TlsUnixClient").finish_non_exhaustive(),
			Self::PlainDyn{..} => f.debug_struct("Stream::PlainDyn").finish_non_exhaustive(),
			Self::TlsDynServer{..} => f.debug_struct("Stream::TlsDynServer").finish_non_exhaustive(),
			Self::TlsDynClient{..} => f.debug_struct("Stream::TlsDynClient").finish_non_exhaustive(),
		}
	}
}

impl Stream {
	fn broken_err(e: &Option<Box<dyn std::error::Error + Send + 'static>>) -> io::Error {
		match e {
			Some(e) => io::Error::new(io::ErrorKind::ConnectionReset, format!("connection invalidated because of a previous failed operation: {}", e)),
			None => io::Error::new(io::ErrorKind::ConnectionReset, "connection invalidated because of a previous failed operation (unknown error)"),
		}
	}

	fn is_valid(&self) -> bool {
		match self {
			Self::Broken{..} => false,
			_ => true,
		}
	}

	async fn starttls_server<T: AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		sock: T,
		acceptor: TlsAcceptor,
		recorder: &verify::RecordingClientVerifier,
		handshake_timeout: Duration,
	) -> io::Result<tls::Info>
		where server::TlsStream<T>: Into<Self>
	{
		let (verify, sock) = recorder.scope(iotimeout(
			handshake_timeout,
			acceptor.accept(sock),
			"TLS handshake timed out",
		)).await;
		match sock {
			Ok(sock) => {
				let info = tls::Info::from_server_conn(sock.get_ref().1).with_verify(verify);
				*self = sock.into();
				Ok(info)
			},
			Err(e) => {
				// kaboom, break the thing
				*self = Self::Broken{e: Some(Box::new(
					opaque(format!("failed to accept TLS connection: {}", e))
				))};
				Err(e)
			},
		}
	}

	async fn starttls_client<T: AsyncRead + AsyncWrite + Unpin>(
		&mut self,
		sock: T,
		name: rustls::ServerName,
		connector: TlsConnector,
		recorder: &verify::RecordingVerifier,
		handshake_timeout: Duration,
	) -> io::Result<tls::Info>
		where client::TlsStream<T>: Into<Self>
	{
		let (verify, sock) = recorder.scope(iotimeout(
			handshake_timeout,
			connector.connect(name, sock),
			"TLS handshake timed out",
		)).await;
		match sock {
			Ok(sock) => {
				let info = tls::Info::from_client_conn(sock.get_ref().1, None).with_verify(verify);
				*self = sock.into();
				Ok(info)
			},
			Err(e) => {
				// kaboom, break the thing
				*self = Self::Broken{e: Some(Box::new(
					opaque(format!("failed to initiate TLS connection: {}", e))
				))};
				Err(e)
			},
		}
	}

	async fn starttls_connect(
		&mut self,
		name: rustls::ServerName,
		ctx: Arc<rustls::ClientConfig>,
		recorder: &verify::RecordingVerifier,
		handshake_timeout: Duration,
	) -> io::Result<tls::Info> {
		let mut tmp = Stream::Broken{e: None};
		std::mem::swap(&mut tmp, self);
		match tmp {
			Self::Broken{ref e} => {
				let result = Err(Self::broken_err(e));
				*self = tmp;
				result
			},
			Self::PlainTcp{rx, tx} => {
				let sock = rx.reunite(tx).unwrap();
				self.starttls_client(sock, name, ctx.into(), recorder, handshake_timeout).await
			},
			#[cfg(unix)]
			Self::PlainUnix{rx, tx} => {
				let sock = rx.reunite(tx).unwrap();
				self.starttls_client(sock, name, ctx.into(), recorder, handshake_timeout).await
			},
			Self::PlainDyn{rx, tx} => {
				let sock = rx.unsplit(tx);
				self.starttls_client(sock, name, ctx.into(), recorder, handshake_timeout).await
			},
			other => {
				*self = other;
				Err(io::Error::new(io::ErrorKind::InvalidInput, "attempt to start TLS on a socket with TLS"))
			},
		}
	}

	async fn starttls_accept(
		&mut self,
		ctx: Arc<rustls::ServerConfig>,
		recorder: &verify::RecordingClientVerifier,
		handshake_timeout: Duration,
	) -> io::Result<tls::Info> {
		let mut tmp = Stream::Broken{e: None};
		std::mem::swap(&mut tmp, self);
		match tmp {
			Self::Broken{ref e} => {
				let result = Err(Self::broken_err(e));
				*self = tmp;
				result
			},
			Self::PlainTcp{rx, tx} => {
				let sock = rx.reunite(tx).unwrap();
				self.starttls_server(sock, ctx.into(), recorder, handshake_timeout).await
			},
			#[cfg(unix)]
			Self::PlainUnix{rx, tx} => {
				let sock = rx.reunite(tx).unwrap();
				self.starttls_server(sock, ctx.into(), recorder, handshake_timeout).await
			},
			Self::PlainDyn{rx, tx} => {
				let sock = rx.unsplit(tx);
				self.starttls_server(sock, ctx.into(), recorder, handshake_timeout).await
			},
			other => {
				*self = other;
				Err(io::Error::new(io::ErrorKind::InvalidInput, "attempt to start TLS on a socket with TLS"))
			},
		}
	}

	/// RFC 5705 keying material export. The split halves are temporarily
	/// reunited to reach the rustls connection, then split again.
	fn export_keying_material(
		&mut self,
		len: usize,
		label: &[u8],
		context: Option<&[u8]>,
	) -> Result<Vec<u8>, String> {
		fn export_server<IO: AsyncRead + AsyncWrite + Unpin>(
			sock: &server::TlsStream<IO>,
			len: usize,
			label: &[u8],
			context: Option<&[u8]>,
		) -> Result<Vec<u8>, String> {
			let mut out = vec![0u8; len];
			match sock.get_ref().1.export_keying_material(&mut out, label, context) {
				Ok(()) => Ok(out),
				Err(e) => Err(format!("{}", e)),
			}
		}

		fn export_client<IO: AsyncRead + AsyncWrite + Unpin>(
			sock: &client::TlsStream<IO>,
			len: usize,
			label: &[u8],
			context: Option<&[u8]>,
		) -> Result<Vec<u8>, String> {
			let mut out = vec![0u8; len];
			match sock.get_ref().1.export_keying_material(&mut out, label, context) {
				Ok(()) => Ok(out),
				Err(e) => Err(format!("{}", e)),
			}
		}

		let mut tmp = Stream::Broken{e: None};
		std::mem::swap(&mut tmp, self);
		let (result, restored) = match tmp {
			Self::TlsTcpServer{rx, tx} => {
				let sock = rx.unsplit(tx);
				let r = export_server(&sock, len, label, context);
				(r, sock.into())
			},
			Self::TlsTcpClient{rx, tx} => {
				let sock = rx.unsplit(tx);
				let r = export_client(&sock, len, label, context);
				(r, sock.into())
			},
			#[cfg(unix)]
			Self::TlsUnixServer{rx, tx} => {
				let sock = rx.unsplit(tx);
				let r = export_server(&sock, len, label, context);
				(r, sock.into())
			},
			#[cfg(unix)]
			Self::TlsUnixClient{rx, tx} => {
				let sock = rx.unsplit(tx);
				let r = export_client(&sock, len, label, context);
				(r, sock.into())
			},
			Self::TlsDynServer{rx, tx} => {
				let sock = rx.unsplit(tx);
				let r = export_server(&sock, len, label, context);
				(r, sock.into())
			},
			Self::TlsDynClient{rx, tx} => {
				let sock = rx.unsplit(tx);
				let r = export_client(&sock, len, label, context);
				(r, sock.into())
			},
			other => {
				let result = Err("keying material requires an established TLS stream".to_string());
				*self = other;
				return result;
			},
		};
		*self = restored;
		result
	}

	fn as_parts_mut(&mut self) -> (&mut (dyn AsyncRead + Unpin + Send + 'static), &mut (dyn AsyncWrite + Unpin + Send + 'static)) {
		match self {
			Self::Broken{ref e} => panic!("broken stream: {:?}", e),
			Self::PlainTcp{ref mut rx, ref mut tx} => (rx, tx),
			#[cfg(unix)]
			Self::PlainUnix{ref mut rx, ref mut tx} => (rx, tx),
			Self::TlsTcpServer{ref mut rx, ref mut tx} => (rx, tx),
			Self::TlsTcpClient{ref mut rx, ref mut tx} => (rx, tx),
			#[cfg(unix)]
			Self::TlsUnixServer{ref mut rx, ref mut tx} => (rx, tx),
			#[cfg(unix)]
			Self::TlsUnixClient{ref mut rx, ref mut tx} => (rx, tx),
			Self::PlainDyn{ref mut rx, ref mut tx} => (rx, tx),
			Self::TlsDynServer{ref mut rx, ref mut tx} => (rx, tx),
			Self::TlsDynClient{ref mut rx, ref mut tx} => (rx, tx),
		}
	}
}

impl AsyncRead for Stream {
	fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
		match &mut *self {
			Stream::Broken{ref e} => Poll::Ready(Err(Self::broken_err(e))),
			Stream::PlainTcp{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			#[cfg(unix)]
			Stream::PlainUnix{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			Stream::TlsTcpServer{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			Stream::TlsTcpClient{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			#[cfg(unix)]
			Stream::TlsUnixServer{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			#[cfg(unix)]
			Stream::TlsUnixClient{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			Stream::PlainDyn{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			Stream::TlsDynServer{rx, ..} => Pin::new(rx).poll_read(cx, buf),
			Stream::TlsDynClient{rx, ..} => Pin::new(rx).poll_read(cx, buf),
		}
	}
}

impl AsyncWrite for Stream {
	fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
		match &mut *self {
			Stream::Broken{ref e} => Poll::Ready(Err(Self::broken_err(e))),
			Stream::PlainTcp{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			#[cfg(unix)]
			Stream::PlainUnix{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			Stream::TlsTcpServer{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			Stream::TlsTcpClient{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			#[cfg(unix)]
			Stream::TlsUnixServer{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			#[cfg(unix)]
			Stream::TlsUnixClient{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			Stream::PlainDyn{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			Stream::TlsDynServer{tx, ..} => Pin::new(tx).poll_write(cx, buf),
			Stream::TlsDynClient{tx, ..} => Pin::new(tx).poll_write(cx, buf),
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match &mut *self {
			Stream::Broken{ref e} => Poll::Ready(Err(Self::broken_err(e))),
			Stream::PlainTcp{tx, ..} => Pin::new(tx).poll_flush(cx),
			#[cfg(unix)]
			Stream::PlainUnix{tx, ..} => Pin::new(tx).poll_flush(cx),
			Stream::TlsTcpServer{tx, ..} => Pin::new(tx).poll_flush(cx),
			Stream::TlsTcpClient{tx, ..} => Pin::new(tx).poll_flush(cx),
			#[cfg(unix)]
			Stream::TlsUnixServer{tx, ..} => Pin::new(tx).poll_flush(cx),
			#[cfg(unix)]
			Stream::TlsUnixClient{tx, ..} => Pin::new(tx).poll_flush(cx),
			Stream::PlainDyn{tx, ..} => Pin::new(tx).poll_flush(cx),
			Stream::TlsDynServer{tx, ..} => Pin::new(tx).poll_flush(cx),
			Stream::TlsDynClient{tx, ..} => Pin::new(tx).poll_flush(cx),
		}
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
		match &mut *self {
			Stream::Broken{ref e} => Poll::Ready(Err(Self::broken_err(e))),
			Stream::PlainTcp{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			#[cfg(unix)]
			Stream::PlainUnix{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			Stream::TlsTcpServer{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			Stream::TlsTcpClient{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			#[cfg(unix)]
			Stream::TlsUnixServer{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			#[cfg(unix)]
			Stream::TlsUnixClient{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			Stream::PlainDyn{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			Stream::TlsDynServer{tx, ..} => Pin::new(tx).poll_shutdown(cx),
			Stream::TlsDynClient{tx, ..} => Pin::new(tx).poll_shutdown(cx),
		}
	}
}

/**
Stream plus the file descriptor it was created from, for the socket options
which need to reach below the tokio surface. Virtual transports carry no
descriptor.
*/
#[derive(Debug)]
pub(crate) struct FdStream {
	#[cfg(unix)]
	fd: Option<RawFd>,
	inner: Stream,
}

impl FdStream {
	pub(crate) fn virtual_stream(inner: Stream) -> Self {
		Self{
			#[cfg(unix)]
			fd: None,
			inner,
		}
	}

	#[cfg(unix)]
	fn raw_fd(&self) -> Option<RawFd> {
		if self.inner.is_valid() {
			self.fd
		} else {
			None
		}
	}
}

impl From<TcpStream> for FdStream {
	fn from(other: TcpStream) -> Self {
		Self{
			#[cfg(unix)]
			fd: Some(other.as_raw_fd()),
			inner: other.into(),
		}
	}
}

#[cfg(unix)]
impl From<UnixStream> for FdStream {
	fn from(other: UnixStream) -> Self {
		Self{
			fd: Some(other.as_raw_fd()),
			inner: other.into(),
		}
	}
}

impl From<server::TlsStream<TcpStream>> for FdStream {
	fn from(other: server::TlsStream<TcpStream>) -> Self {
		Self{
			#[cfg(unix)]
			fd: Some(other.get_ref().0.as_raw_fd()),
			inner: other.into(),
		}
	}
}

impl From<client::TlsStream<TcpStream>> for FdStream {
	fn from(other: client::TlsStream<TcpStream>) -> Self {
		Self{
			#[cfg(unix)]
			fd: Some(other.get_ref().0.as_raw_fd()),
			inner: other.into(),
		}
	}
}

#[cfg(unix)]
impl From<server::TlsStream<UnixStream>> for FdStream {
	fn from(other: server::TlsStream<UnixStream>) -> Self {
		Self{
			fd: Some(other.get_ref().0.as_raw_fd()),
			inner: other.into(),
		}
	}
}

#[cfg(unix)]
impl From<client::TlsStream<UnixStream>> for FdStream {
	fn from(other: client::TlsStream<UnixStream>) -> Self {
		Self{
			fd: Some(other.get_ref().0.as_raw_fd()),
			inner: other.into(),
		}
	}
}

impl Deref for FdStream {
	type Target = Stream;

	fn deref(&self) -> &Self::Target {
		&self.inner
	}
}

impl DerefMut for FdStream {
	fn deref_mut(&mut self) -> &mut Self::Target {
		&mut self.inner
	}
}

enum MsgResult {
	Continue,
	ReadDeadlineChanged,
	Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectionMode {
	Closed,
	Blocked,
	Open,
}

impl DirectionMode {
	fn may(&self) -> bool {
		match self {
			Self::Closed | Self::Blocked => false,
			Self::Open => true,
		}
	}

	fn may_ever(&self) -> bool {
		match self {
			Self::Closed => false,
			Self::Open | Self::Blocked => true,
		}
	}

	fn unblock(&self) -> DirectionMode {
		match self {
			Self::Blocked => Self::Open,
			Self::Open | Self::Closed => *self,
		}
	}

	fn block(&self) -> DirectionMode {
		match self {
			Self::Open => Self::Blocked,
			Self::Blocked | Self::Closed => *self,
		}
	}
}

/**
Counters shared between the socket handle (Lua thread) and its worker.

The handle accounts accepted bytes synchronously; the worker accounts
transmission. `staged` is the observable backlog: bytes beyond the
high-water mark which entered via buffered writes or `finish`.
*/
pub(crate) struct Shared {
	pub(crate) queued: AtomicUsize,
	pub(crate) staged: AtomicUsize,
	pub(crate) bytes_written: AtomicU64,
	pub(crate) want_drain: AtomicBool,
	pub(crate) writable: AtomicBool,
	pub(crate) tls_started: AtomicBool,
	pub(crate) tls_established: AtomicBool,
	pub(crate) finalizing: AtomicBool,
	pub(crate) write_cap: AtomicUsize,
	pub(crate) hwm: AtomicUsize,
}

impl Shared {
	pub(crate) fn new(hwm: usize, tls: bool) -> Arc<Self> {
		Arc::new(Self{
			queued: AtomicUsize::new(0),
			staged: AtomicUsize::new(0),
			bytes_written: AtomicU64::new(0),
			want_drain: AtomicBool::new(false),
			writable: AtomicBool::new(true),
			tls_started: AtomicBool::new(tls),
			tls_established: AtomicBool::new(tls),
			finalizing: AtomicBool::new(false),
			write_cap: AtomicUsize::new(0),
			hwm: AtomicUsize::new(hwm),
		})
	}

	pub(crate) fn backlog(&self) -> usize {
		self.staged.load(Ordering::SeqCst)
	}

	pub(crate) fn pending(&self) -> usize {
		self.queued.load(Ordering::SeqCst)
	}
}

struct TxBuf {
	data: Bytes,
	len: usize,
	staged: bool,
}

pub(crate) struct StreamWorker {
	rx: mpsc::UnboundedReceiver<ControlMessage>,
	conn: FdStream,
	cfg: config::StreamConfig,
	shared: Arc<Shared>,
	buf: Option<Limit<BytesMut>>,
	rx_mode: DirectionMode,
	tx_mode: DirectionMode,
	txq: VecDeque<TxBuf>,
	end_after_flush: bool,
	empty_packet_pending: bool,
	handle: LuaRegistryHandle,
}

impl StreamWorker {
	pub(crate) fn new(
			rx: mpsc::UnboundedReceiver<ControlMessage>,
			conn: FdStream,
			cfg: config::StreamConfig,
			shared: Arc<Shared>,
			handle: LuaRegistryHandle,
	) -> Self {
		Self{
			rx,
			conn,
			cfg,
			shared,
			handle,
			tx_mode: DirectionMode::Open,
			rx_mode: DirectionMode::Open,
			txq: VecDeque::new(),
			buf: None,
			end_after_flush: false,
			empty_packet_pending: false,
		}
	}

	#[cfg(unix)]
	fn set_keepalive(&self, enabled: bool) -> io::Result<()> {
		let fd = match self.conn.raw_fd() {
			Some(fd) => fd,
			None => return Err(io::Error::new(
				io::ErrorKind::Unsupported,
				"socket options are not available on this transport",
			)),
		};
		nix::sys::socket::setsockopt(
			fd,
			nix::sys::socket::sockopt::KeepAlive,
			&enabled,
		)?;
		Ok(())
	}

	#[cfg(not(unix))]
	fn set_keepalive(&self, _enabled: bool) -> io::Result<()> {
		Err(io::Error::new(
			io::ErrorKind::Unsupported,
			"socket options are not available on this transport",
		))
	}

	/// Queue accepted bytes, split to the configured fragment cap.
	fn push_tx(&mut self, mut data: Bytes, staged: bool) {
		let cap = self.shared.write_cap.load(Ordering::SeqCst);
		if cap > 0 {
			while data.len() > cap {
				let chunk = data.split_to(cap);
				self.txq.push_back(TxBuf{len: chunk.len(), data: chunk, staged});
			}
		}
		if data.len() > 0 {
			self.txq.push_back(TxBuf{len: data.len(), data, staged});
		}
	}

	/// Transmission accounting for a fully written buffer.
	fn complete_tx(&self, buf: &TxBuf) {
		self.shared.queued.fetch_sub(buf.len, Ordering::SeqCst);
		if buf.staged {
			self.shared.staged.fetch_sub(buf.len, Ordering::SeqCst);
			self.shared.bytes_written.fetch_add(buf.len as u64, Ordering::SeqCst);
		}
	}

	/// Accounting for bytes dropped without transmission.
	fn drop_tx(&self, len: usize, staged: bool) {
		self.shared.queued.fetch_sub(len, Ordering::SeqCst);
		if staged {
			self.shared.staged.fetch_sub(len, Ordering::SeqCst);
		}
	}

	async fn force_flush(&mut self) -> io::Result<()> {
		while let Some(mut buf) = self.txq.pop_front() {
			iotimeout(self.cfg.send_timeout, self.conn.write_all_buf(&mut buf.data), "write timed out").await?;
			self.complete_tx(&buf);
		}
		iotimeout(self.cfg.send_timeout, self.conn.flush(), "flush timed out").await?;
		Ok(())
	}

	async fn clean_shutdown(&mut self) -> io::Result<()> {
		match self.force_flush().await {
			// ignore any errors here, we're doing a shutdown. this is best
			// effort.
			Ok(..) | Err(..) => (),
		};
		self.conn.shutdown().await
	}

	async fn clean_shutdown_with_msg(&mut self, err: Option<Box<dyn std::error::Error + Send + 'static>>) {
		self.shared.writable.store(false, Ordering::SeqCst);
		let shutdown_err = self.clean_shutdown().await.err();
		let err = err.or(match shutdown_err {
			Some(x) => Some(Box::new(x) as Box<dyn std::error::Error + Send + 'static>),
			None => None,
		});
		MAIN_CHANNEL.fire_and_forget(
			Message::Disconnect{
				handle: self.handle.clone(),
				error: err,
			},
		).await;
	}

	/// Runs whenever the backlog just became empty: emit the deferred empty
	/// TLS record, report drain, complete a pending `end`.
	async fn backlog_drained(&mut self) -> io::Result<MsgResult> {
		if self.empty_packet_pending && self.shared.tls_established.load(Ordering::SeqCst) {
			self.conn.write_all(&[]).await?;
			self.conn.flush().await?;
			self.empty_packet_pending = false;
		}
		// bytes accepted by the handle may still sit in the control channel;
		// the backlog only counts as drained once those arrived and flushed
		if self.shared.pending() == 0 && self.shared.want_drain.swap(false, Ordering::SeqCst) {
			if MAIN_CHANNEL.send(Message::Drained{handle: self.handle.clone()}).await.is_err() {
				return Ok(MsgResult::Exit);
			}
		}
		if self.end_after_flush && !self.empty_packet_pending && self.tx_mode.may_ever() {
			self.conn.flush().await?;
			self.conn.shutdown().await?;
			self.tx_mode = DirectionMode::Closed;
			if !self.rx_mode.may_ever() {
				MAIN_CHANNEL.fire_and_forget(Message::Disconnect{
					handle: self.handle.clone(),
					error: None,
				}).await;
				return Ok(MsgResult::Exit);
			}
		}
		Ok(MsgResult::Continue)
	}

	async fn proc_msg(&mut self, msg: ControlMessage) -> io::Result<MsgResult> {
		match msg {
			ControlMessage::Close => {
				self.clean_shutdown_with_msg(None).await;
				Ok(MsgResult::Exit)
			},
			ControlMessage::Terminate => {
				self.shared.writable.store(false, Ordering::SeqCst);
				while let Some(buf) = self.txq.pop_front() {
					self.drop_tx(buf.len, buf.staged);
				}
				MAIN_CHANNEL.fire_and_forget(Message::Disconnect{
					handle: self.handle.clone(),
					error: None,
				}).await;
				Ok(MsgResult::Exit)
			},
			ControlMessage::Shutdown{read_only} => {
				if read_only {
					self.buf = None;
					self.rx_mode = DirectionMode::Closed;
				} else if self.tx_mode.may_ever() {
					self.shared.writable.store(false, Ordering::SeqCst);
					// flush is best effort on shutdown
					let _ = self.force_flush().await;
					let _ = self.conn.shutdown().await;
					self.tx_mode = DirectionMode::Closed;
				}
				Ok(MsgResult::Continue)
			},
			ControlMessage::PauseReads => {
				self.rx_mode = self.rx_mode.block();
				Ok(MsgResult::Continue)
			},
			ControlMessage::ResumeReads => {
				self.rx_mode = self.rx_mode.unblock();
				Ok(MsgResult::ReadDeadlineChanged)
			},
			ControlMessage::Write{data, staged} => {
				if self.tx_mode.may_ever() {
					self.push_tx(data, staged);
				} else {
					self.drop_tx(data.len(), staged);
				}
				Ok(MsgResult::Continue)
			},
			ControlMessage::WriteEmptyTls => {
				if self.shared.tls_started.load(Ordering::SeqCst) {
					self.empty_packet_pending = true;
					if self.txq.is_empty() {
						return self.backlog_drained().await;
					}
				}
				Ok(MsgResult::Continue)
			},
			ControlMessage::End(data) => {
				if let Some(data) = data {
					if self.tx_mode.may_ever() {
						self.push_tx(data, true);
					} else {
						self.drop_tx(data.len(), true);
					}
				}
				self.end_after_flush = true;
				self.shared.writable.store(false, Ordering::SeqCst);
				if self.txq.is_empty() {
					return self.backlog_drained().await;
				}
				Ok(MsgResult::Continue)
			},
			ControlMessage::SetOption(option) => {
				match option {
					SocketOption::KeepAlive(enabled) => self.set_keepalive(enabled)?,
				};
				Ok(MsgResult::Continue)
			},
			ControlMessage::SetIdleTimeout(d) => {
				self.cfg.read_timeout = d;
				Ok(MsgResult::ReadDeadlineChanged)
			},
			ControlMessage::StartTls(start, new_handle) => {
				self.force_flush().await?;
				// the pair link must be in place before the first handshake
				// byte can produce an event
				if let Some(handle) = new_handle {
					self.handle = handle;
				}
				self.shared.tls_started.store(true, Ordering::SeqCst);
				let local_certs = start.local_certs();
				let result = match start {
					StartTls::Accept(parts) => {
						self.conn.starttls_accept(parts.cfg.clone(), &parts.recorder, self.cfg.ssl_handshake_timeout).await
					},
					StartTls::Connect(name, parts) => {
						self.conn.starttls_connect(name, parts.cfg.clone(), &parts.recorder, self.cfg.ssl_handshake_timeout).await
					},
				};
				match result {
					Ok(info) => {
						let info = info.with_local_certs(local_certs);
						self.shared.tls_established.store(true, Ordering::SeqCst);
						match MAIN_CHANNEL.send(Message::TlsEstablished{handle: self.handle.clone(), info}).await {
							Ok(_) => {
								self.rx_mode = self.rx_mode.unblock();
								self.tx_mode = self.tx_mode.unblock();
								if self.txq.is_empty() && self.empty_packet_pending {
									return self.backlog_drained().await;
								}
								Ok(MsgResult::ReadDeadlineChanged)
							},
							Err(_) => Ok(MsgResult::Exit),
						}
					},
					Err(e) => {
						log::debug!("TLS handshake error: {}", e);
						let _ = MAIN_CHANNEL.send(Message::TlsFailed{
							handle: self.handle.clone(),
							error: format!("{}", e),
						}).await;
						Ok(MsgResult::Exit)
					},
				}
			},
			ControlMessage::ExportKeyingMaterial{len, label, context, reply} => {
				let result = self.conn.export_keying_material(len, &label, context.as_deref());
				let _ = reply.try_send(result);
				Ok(MsgResult::Continue)
			},
		}
	}

	async fn run(mut self) {
		let mut read_deadline = Instant::now() + self.cfg.read_timeout;
		let mut write_deadline = Instant::now() + self.cfg.send_timeout;
		let mut txdummy = Bytes::new();
		let mut rxdummy = BytesMut::new().limit(0);
		let mut has_pending_write = false;
		loop {
			if !self.rx_mode.may_ever() && !self.tx_mode.may_ever() {
				// neither direction can ever carry bytes again
				self.buf = None;
				self.clean_shutdown_with_msg(None).await;
				return;
			}

			let rxbuf = if self.rx_mode.may() {
				let read_size = self.cfg.read_size;
				self.buf.get_or_insert_with(|| { BytesMut::with_capacity(read_size).limit(read_size) })
			} else {
				&mut rxdummy
			};

			let txbuf: &mut Bytes = if self.tx_mode.may() {
				match self.txq.front_mut() {
					Some(buf) => {
						if !has_pending_write {
							// this is the first time we're seeing a buffer since the last successful write -> we can advance the write deadline
							write_deadline = Instant::now() + self.cfg.send_timeout;
						}
						has_pending_write = true;
						&mut buf.data
					},
					None => {
						has_pending_write = false;
						&mut txdummy
					}
				}
			} else {
				&mut txdummy
			};

			let (rx, tx) = self.conn.as_parts_mut();
			pin_mut!(rx);
			pin_mut!(tx);

			select! {
				result = timeout_at(read_deadline.into(), rx.read_buf(rxbuf)), if self.rx_mode.may() => match result {
					Ok(Ok(0)) => {
						debug_assert!(rxbuf.get_ref().has_remaining_mut());
						// at eof; the dispatcher decides whether the socket
						// stays half-open
						self.buf = None;
						self.rx_mode = DirectionMode::Closed;
						match MAIN_CHANNEL.send(Message::ReadClosed{handle: self.handle.clone()}).await {
							Ok(_) => (),
							Err(_) => return,
						};
					},
					Ok(Ok(n)) => {
						// This is very efficient especially on small reads:
						// instead of resizing the buffer, we keep the existing
						// buffer to avoid fragmentation, at least a little.
						let buf = {
							let inner = rxbuf.get_mut();
							let buf = Bytes::copy_from_slice(&inner[..]);
							inner.truncate(0);
							inner.reserve(self.cfg.read_size);
							drop(inner);
							rxbuf.set_limit(self.cfg.read_size);
							buf
						};
						debug_assert!(buf.len() == n);
						match MAIN_CHANNEL.send(Message::Incoming{
							handle: self.handle.clone(),
							data: buf,
						}).await {
							Ok(_) => (),
							// again, only during shutdown
							Err(_) => return,
						};
						// successful read? -> advance deadline
						read_deadline = Instant::now() + self.cfg.read_timeout;
					},
					Ok(Err(e)) => {
						MAIN_CHANNEL.fire_and_forget(Message::Disconnect{handle: self.handle.clone(), error: Some(Box::new(e))}).await;
						return;
					},
					// inactivity timeout
					Err(_) => {
						let (reply_tx, reply_rx) = oneshot::channel();
						// if it does not really get sent, the reply_rx will
						// complete immediately because the tx got dropped and
						// thus the connection will be closed because of the
						// read timeout. perfect.
						MAIN_CHANNEL.fire_and_forget(Message::IdleTimeout{
							handle: self.handle.clone(),
							keepalive: reply_tx,
						}).await;

						match reply_rx.await {
							Ok(true) => {
								read_deadline = Instant::now() + self.cfg.read_timeout;
							},
							Ok(false) | Err(_) => {
								MAIN_CHANNEL.fire_and_forget(Message::Disconnect{
									handle: self.handle.clone(),
									error: Some(Box::new(io::Error::new(
										io::ErrorKind::TimedOut,
										"read timeout",
									))),
								}).await;
								// it's dead jim.
								return;
							},
						}
					},
				},
				result = iodeadline(write_deadline, tx.write_all_buf(txbuf), "write timed out"), if self.tx_mode.may() && txbuf.has_remaining() => match result {
					Ok(()) => {
						// set to false because we cleared the buffer. if this
						// is false, the write deadline will be advanced on
						// the next write.
						has_pending_write = false;
						let done = match self.txq.pop_front() {
							Some(buf) => buf,
							None => return,
						};
						self.complete_tx(&done);
						if self.txq.is_empty() {
							match self.backlog_drained().await {
								Ok(MsgResult::Exit) => return,
								Ok(_) => (),
								Err(e) => {
									MAIN_CHANNEL.fire_and_forget(Message::Disconnect{handle: self.handle.clone(), error: Some(Box::new(e))}).await;
									return;
								},
							}
						}
					},
					Err(e) => {
						MAIN_CHANNEL.fire_and_forget(Message::Disconnect{handle: self.handle.clone(), error: Some(Box::new(e))}).await;
						return;
					},
				},
				msg = self.rx.recv() => match msg {
					Some(msg) => match self.proc_msg(msg).await {
						Ok(MsgResult::Exit) => return,
						Ok(MsgResult::ReadDeadlineChanged) => {
							read_deadline = Instant::now() + self.cfg.read_timeout;
						},
						Ok(MsgResult::Continue) => (),
						Err(e) => {
							MAIN_CHANNEL.fire_and_forget(Message::Disconnect{handle: self.handle.clone(), error: Some(Box::new(e))}).await;
							return
						},
					},
					None => return,
				},
				_ = MAIN_CHANNEL.closed() => return,
			}
		}
	}
}

impl Spawn for StreamWorker {
	fn spawn(self) {
		tokio::spawn(self.run());
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	use mlua::prelude::*;

	fn test_worker(hwm: usize) -> StreamWorker {
		let lua = Lua::new();
		let key = lua.create_registry_value(0i64).unwrap();
		let (_tx, rx) = mpsc::unbounded_channel();
		StreamWorker::new(
			rx,
			FdStream::virtual_stream(Stream::Broken{e: None}),
			config::StreamConfig::default(),
			Shared::new(hwm, false),
			key.into(),
		)
	}

	#[test]
	fn push_tx_chunks_to_fragment_cap() {
		let mut worker = test_worker(1024);
		worker.shared.write_cap.store(512, Ordering::SeqCst);
		worker.push_tx(Bytes::from(vec![0u8; 1500]), false);
		let lens: Vec<usize> = worker.txq.iter().map(|b| b.len).collect();
		assert_eq!(lens, vec![512, 512, 476]);
	}

	#[test]
	fn push_tx_unchunked_without_cap() {
		let mut worker = test_worker(1024);
		worker.push_tx(Bytes::from(vec![0u8; 1500]), true);
		assert_eq!(worker.txq.len(), 1);
		assert!(worker.txq[0].staged);
	}

	#[test]
	fn completion_accounting_balances() {
		let worker = test_worker(1024);
		worker.shared.queued.store(100, Ordering::SeqCst);
		worker.shared.staged.store(40, Ordering::SeqCst);
		worker.complete_tx(&TxBuf{data: Bytes::new(), len: 60, staged: false});
		worker.complete_tx(&TxBuf{data: Bytes::new(), len: 40, staged: true});
		assert_eq!(worker.shared.pending(), 0);
		assert_eq!(worker.shared.backlog(), 0);
		assert_eq!(worker.shared.bytes_written.load(Ordering::SeqCst), 40);
	}

	#[test]
	fn direction_mode_blocking() {
		let mode = DirectionMode::Open;
		assert!(mode.may());
		let blocked = mode.block();
		assert!(!blocked.may());
		assert!(blocked.may_ever());
		assert_eq!(blocked.unblock(), DirectionMode::Open);
		assert_eq!(DirectionMode::Closed.unblock(), DirectionMode::Closed);
	}
}

impl From<Box<dyn DuplexIo>> for FdStream {
	fn from(other: Box<dyn DuplexIo>) -> Self {
		Self::virtual_stream(other.into())
	}
}

impl From<server::TlsStream<Box<dyn DuplexIo>>> for FdStream {
	fn from(other: server::TlsStream<Box<dyn DuplexIo>>) -> Self {
		Self::virtual_stream(other.into())
	}
}

impl From<client::TlsStream<Box<dyn DuplexIo>>> for FdStream {
	fn from(other: client::TlsStream<Box<dyn DuplexIo>>) -> Self {
		Self::virtual_stream(other.into())
	}
}
