#[cfg(unix)]
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tokio::sync::mpsc;

use tokio_rustls::{client, rustls, TlsConnector};

use crate::config;
use crate::core::{
	MAIN_CHANNEL,
	LuaRegistryHandle,
	Message,
	Spawn,
};
use crate::error::SysError;
use crate::ioutil::iotimeout;
use crate::tls;

use super::handle::AddrStr;
use super::msg::ControlMessage;
use super::worker::{FdStream, Shared, StreamWorker};


pub(crate) enum ConnectTarget {
	Tcp{
		host: String,
		port: u16,
	},
	#[cfg(unix)]
	Unix{
		path: PathBuf,
	},
	#[cfg(windows)]
	Pipe{
		name: String,
	},
}

pub(crate) struct ConnectWorker {
	rx: mpsc::UnboundedReceiver<ControlMessage>,
	target: ConnectTarget,
	connect_cfg: config::ClientConfig,
	stream_cfg: config::StreamConfig,
	tls: Option<(rustls::ServerName, tls::ClientTls)>,
	shared: Arc<Shared>,
	handle: LuaRegistryHandle,
}

impl ConnectWorker {
	pub(crate) fn new(
			rx: mpsc::UnboundedReceiver<ControlMessage>,
			target: ConnectTarget,
			tls: Option<(rustls::ServerName, tls::ClientTls)>,
			connect_cfg: config::ClientConfig,
			stream_cfg: config::StreamConfig,
			shared: Arc<Shared>,
			handle: LuaRegistryHandle,
	) -> Self {
		Self{
			rx,
			target,
			tls,
			connect_cfg,
			stream_cfg,
			shared,
			handle,
		}
	}

	async fn fail(handle: LuaRegistryHandle, error: SysError) {
		MAIN_CHANNEL.fire_and_forget(Message::ConnectFailed{handle, error}).await;
	}

	/// Report establishment and optionally drive the TLS handshake, then
	/// hand the transport to the stream worker.
	async fn establish<T>(self, sock: T, local: Option<AddrStr>) -> Option<(FdStream, mpsc::UnboundedReceiver<ControlMessage>, config::StreamConfig, Arc<Shared>, LuaRegistryHandle)>
	where
		T: AsyncRead + AsyncWrite + Unpin + Into<FdStream>,
		client::TlsStream<T>: Into<FdStream>,
	{
		if self.tls.is_some() {
			// visible before the open callback can observe the socket
			self.shared.tls_started.store(true, Ordering::SeqCst);
		}
		match MAIN_CHANNEL.send(Message::Connected{handle: self.handle.clone(), local}).await {
			Ok(_) => (),
			// can only happen during shutdown, drop it.
			Err(_) => return None,
		};
		let conn: FdStream = match self.tls {
			Some((name, parts)) => {
				let connector: TlsConnector = parts.cfg.clone().into();
				let handshake_timeout = self.stream_cfg.ssl_handshake_timeout;
				let (verify, result) = parts.recorder.scope(async move {
					iotimeout(handshake_timeout, connector.connect(name, sock), "timeout during TLS handshake").await
				}).await;
				let sock = match result {
					Ok(sock) => sock,
					Err(e) => {
						MAIN_CHANNEL.fire_and_forget(Message::TlsFailed{
							handle: self.handle,
							error: format!("{}", e),
						}).await;
						return None;
					},
				};
				let info = tls::Info::from_client_conn(sock.get_ref().1, None)
					.with_verify(verify)
					.with_local_certs(parts.local_certs.clone());
				self.shared.tls_established.store(true, Ordering::SeqCst);
				match MAIN_CHANNEL.send(Message::TlsEstablished{handle: self.handle.clone(), info}).await {
					Ok(_) => (),
					// can only happen during shutdown, drop it.
					Err(_) => return None,
				};
				sock.into()
			},
			None => sock.into(),
		};
		Some((conn, self.rx, self.stream_cfg, self.shared, self.handle))
	}

	async fn run(mut self) {
		let connect_timeout = self.connect_cfg.connect_timeout;
		let target = std::mem::replace(&mut self.target, ConnectTarget::Tcp{
			host: String::new(),
			port: 0,
		});
		let parts = match target {
			ConnectTarget::Tcp{host, port} => {
				let sock = match iotimeout(
					connect_timeout,
					TcpStream::connect((host.as_str(), port)),
					"connection timed out",
				).await {
					Ok(sock) => sock,
					Err(e) => {
						let error = SysError::new("connect", &e).with_address(host, Some(port));
						return Self::fail(self.handle, error).await;
					},
				};
				let local = sock.local_addr().ok().map(AddrStr::from);
				self.establish(sock, local).await
			},
			#[cfg(unix)]
			ConnectTarget::Unix{path} => {
				let sock = match iotimeout(
					connect_timeout,
					UnixStream::connect(&path),
					"connection timed out",
				).await {
					Ok(sock) => sock,
					Err(e) => {
						let error = SysError::new("connect", &e)
							.with_address(path.to_string_lossy(), None);
						return Self::fail(self.handle, error).await;
					},
				};
				let local = sock.local_addr().ok().map(AddrStr::from);
				self.establish(sock, local).await
			},
			#[cfg(windows)]
			ConnectTarget::Pipe{name} => {
				let sock = match tokio::net::windows::named_pipe::ClientOptions::new().open(&name) {
					Ok(sock) => Box::new(sock) as Box<dyn super::worker::DuplexIo>,
					Err(e) => {
						let error = SysError::new("connect", &e).with_address(name, None);
						return Self::fail(self.handle, error).await;
					},
				};
				self.establish(sock, None).await
			},
		};
		if let Some((conn, rx, stream_cfg, shared, handle)) = parts {
			StreamWorker::new(rx, conn, stream_cfg, shared, handle).spawn();
		}
	}
}

impl Spawn for ConnectWorker {
	fn spawn(self) {
		tokio::spawn(async move { self.run().await });
	}
}
