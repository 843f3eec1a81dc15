use mlua::prelude::*;

use std::error::Error;
use std::fmt;
use std::ops::{Deref, Drop};
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;

use lazy_static::lazy_static;

use tokio::runtime::{Builder, Runtime};
use tokio::sync;
use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::conversion::opaque;
use crate::error::SysError;
use crate::stream::{AddrStr, FdStream};
use crate::tls;

/**
# Message / Method Call into Lua

The variants of this enum reflect calls into the Lua code, triggered by the
socket workers running in the tokio runtime. The dispatch loop in
[`crate::dispatch`] drains these and invokes the registered script callbacks.
*/
#[derive(Debug)]
pub(crate) enum Message {
	/// An outbound connection completed its TCP (or pipe) establishment.
	Connected{
		/// The registry key of the connection handle.
		handle: LuaRegistryHandle,
		/// The local address the transport bound to, if any.
		local: Option<AddrStr>,
	},

	/// An outbound connection attempt failed.
	ConnectFailed{
		handle: LuaRegistryHandle,
		error: SysError,
	},

	/// A TLS handshake completed on a connection (outbound, accepted after
	/// STARTTLS, or a wrapped upgrade pair).
	TlsEstablished{
		handle: LuaRegistryHandle,
		info: tls::Info,
	},

	/// A TLS handshake failed; the transport is no longer usable.
	TlsFailed{
		handle: LuaRegistryHandle,
		error: String,
	},

	/// Decoded inbound bytes.
	Incoming{
		handle: LuaRegistryHandle,
		data: Bytes,
	},

	/// The write backlog drained after a partial acceptance or staging.
	Drained{
		handle: LuaRegistryHandle,
	},

	/// The peer closed its writing side (FIN).
	ReadClosed{
		handle: LuaRegistryHandle,
	},

	/// No bytes arrived within the configured inactivity interval.
	IdleTimeout{
		handle: LuaRegistryHandle,

		/// Reply channel: true keeps the connection open and re-arms the
		/// timer. Dropping the channel closes the connection.
		keepalive: oneshot::Sender<bool>,
	},

	/// The connection is gone; this is the last message for its handle.
	Disconnect{
		handle: LuaRegistryHandle,
		error: Option<Box<dyn Error + Send + 'static>>,
	},

	/// A plain connection has been accepted.
	Accepted{
		/// The registry key of the listener handle owning the connection.
		handle: LuaRegistryHandle,
		stream: FdStream,
		remote: AddrStr,
	},

	/// A direct-TLS connection has been accepted and finished its handshake.
	AcceptedTls{
		handle: LuaRegistryHandle,
		stream: FdStream,
		remote: AddrStr,
		info: tls::Info,
	},

	/// Ciphertext produced by a duplex-bridged TLS engine, to be handed to
	/// the script's stream object.
	DuplexWrite{
		handle: LuaRegistryHandle,
		data: Bytes,
	},

	/// A duplex-bridged engine shut down; the script stream should close.
	DuplexClose{
		handle: LuaRegistryHandle,
	},
}

/// Wrapper around an mpsc channel which brokers access to the rx/tx pair
pub(crate) struct MpscChannel<T> {
	rx: Mutex<mpsc::Receiver<T>>,
	tx: mpsc::Sender<T>,
}

impl<T> MpscChannel<T> {
	/// Create a new channel with the given depth
	fn new(depth: usize) -> Self {
		let (tx, rx) = mpsc::channel(depth);
		Self{rx: Mutex::new(rx), tx}
	}

	/// Lock the receiver
	///
	/// If locking fails, a lua error is returned. Locking can only fail if the previous user has paniced .... in which case we're in trouble.
	pub(crate) fn lock_rx_lua(&self) -> LuaResult<MutexGuard<'_, mpsc::Receiver<T>>> {
		match self.rx.lock() {
			Ok(l) => Ok(l),
			Err(_) => Err(opaque("something has paniced before and accessing the global receiver is unsafe now").into()),
		}
	}

	pub(crate) fn clone_tx(&self) -> mpsc::Sender<T> {
		self.tx.clone()
	}

	#[inline]
	pub(crate) async fn fire_and_forget(&self, msg: T) {
		let _ = self.tx.send(msg).await;
	}

	#[inline]
	#[must_use]
	pub(crate) async fn send(&self, msg: T) -> Result<(), mpsc::error::SendError<T>> {
		self.tx.send(msg).await
	}

	#[inline]
	pub(crate) async fn closed(&self) -> () {
		self.tx.closed().await
	}
}

static MAIN_CAPACITY: usize = 1024;

lazy_static! {
	#[doc(hidden)]
	pub(crate) static ref RUNTIME: RwLock<Option<Runtime>> = RwLock::new(Some(Builder::new_multi_thread().enable_all().build().unwrap()));
	#[doc(hidden)]
	pub(crate) static ref MAIN_CHANNEL: MpscChannel<Message> = MpscChannel::new(MAIN_CAPACITY);
	pub(crate) static ref WAKEUP: Arc<sync::Notify> = Arc::new(sync::Notify::new());
	#[doc(hidden)]
	pub(crate) static ref GC_FLAG: AtomicBool = AtomicBool::new(false);
}

// Keep-alive accounting for the dispatch loop: the loop may only exit once
// nothing holds a keep-alive ref. This counter concerns process lifetime
// only; memory ownership is via Arc and entirely independent (an unref'd
// socket stays valid).
static KEEPALIVE: AtomicUsize = AtomicUsize::new(0);
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

pub(crate) fn keepalive_acquire() {
	KEEPALIVE.fetch_add(1, Ordering::SeqCst);
}

pub(crate) fn keepalive_release() {
	if KEEPALIVE.fetch_sub(1, Ordering::SeqCst) == 1 {
		WAKEUP.notify_one();
	}
}

pub(crate) fn keepalive_count() -> usize {
	KEEPALIVE.load(Ordering::SeqCst)
}

pub(crate) fn shutdown_requested() -> bool {
	SHUTDOWN.load(Ordering::SeqCst)
}

pub(crate) fn request_shutdown() {
	SHUTDOWN.store(true, Ordering::SeqCst);
	WAKEUP.notify_one();
}

pub(crate) fn get_runtime<'x>(guard: &'x RwLockReadGuard<'x, Option<Runtime>>) -> LuaResult<&'x Runtime> {
	match guard.as_ref() {
		Some(v) => Ok(v),
		None => Err(opaque("server backend runtime has exited").into()),
	}
}

pub(crate) trait Spawn {
	fn spawn(self);
}

pub(crate) struct WakeupOnDrop();

impl Drop for WakeupOnDrop {
	fn drop(&mut self) {
		WAKEUP.notify_one();
	}
}

pub(crate) struct GcOnDrop(WakeupOnDrop);

impl GcOnDrop {
	pub(crate) fn prepare() -> Self {
		Self(WakeupOnDrop())
	}
}

impl Drop for GcOnDrop {
	fn drop(&mut self) {
		GC_FLAG.store(true, Ordering::SeqCst);
	}
}

pub(crate) struct GcLuaRegistryKey{
	inner: LuaRegistryKey,
	#[allow(dead_code)]
	guard: GcOnDrop,
}

impl From<LuaRegistryKey> for GcLuaRegistryKey {
	fn from(other: LuaRegistryKey) -> Self {
		Self{inner: other, guard: GcOnDrop::prepare()}
	}
}

impl Deref for GcLuaRegistryKey {
	type Target = LuaRegistryKey;

	fn deref(&self) -> &Self::Target {
		&self.inner
	}
}

impl AsRef<LuaRegistryKey> for GcLuaRegistryKey {
	fn as_ref(&self) -> &LuaRegistryKey {
		&self.inner
	}
}

#[derive(Clone)]
pub(crate) struct LuaRegistryHandle(pub(crate) Arc<GcLuaRegistryKey>);

impl From<LuaRegistryKey> for LuaRegistryHandle {
	fn from(other: LuaRegistryKey) -> Self {
		Self(Arc::new(other.into()))
	}
}

impl Deref for LuaRegistryHandle {
	type Target = LuaRegistryKey;

	fn deref(&self) -> &Self::Target {
		&self.0.inner
	}
}

impl AsRef<LuaRegistryKey> for LuaRegistryHandle {
	fn as_ref(&self) -> &LuaRegistryKey {
		&self.0.inner
	}
}

impl fmt::Debug for LuaRegistryHandle {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		fmt::Debug::fmt(&self.0.inner, f)
	}
}

#[macro_export]
macro_rules! with_runtime_lua {
	($($b:stmt);*) => {
		{
			let guard = crate::core::RUNTIME.read().unwrap();
			let rt = crate::core::get_runtime(&guard)?;
			let _rt_guard = rt.enter();
			$($b)*
		}
	}
}
