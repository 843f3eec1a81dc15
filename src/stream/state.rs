use std::fmt;

use tokio_rustls::rustls;

use crate::tls;

use super::msg::StartTls;

/**
TLS posture of an established connection.

At socket creation a TLS context may be provided by the caller. It is then
stored within the socket state so a later upgrade does not need to pass one
explicitly.
*/
#[derive(Clone)]
pub(crate) enum PreTlsConfig {
	/// No configuration was provided during socket creation.
	None,

	/// A client-side TLS context was provided.
	Client(rustls::ServerName, tls::ClientTls),

	/// A server-side TLS context was provided.
	Server(tls::ServerTls),
}

impl fmt::Debug for PreTlsConfig {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::None => write!(f, "PreTlsConfig::None"),
			Self::Client(name, ..) => write!(f, "PreTlsConfig::Client({:?})", name),
			Self::Server(..) => write!(f, "PreTlsConfig::Server(..)"),
		}
	}
}

/**
TLS progress within the Open / HalfClosedRemote states.
*/
#[derive(Debug, Clone)]
pub(crate) enum TlsPhase {
	/// Plaintext; an upgrade may still happen based on the stored config.
	Plain(PreTlsConfig),

	/// The handshake has been handed to the worker.
	Handshaking,

	/// The handshake has completed.
	Established(Box<tls::Info>),
}

/**
Represents an error during an attempt to mutate a [`SocketState`].
*/
#[derive(Debug, Clone, Copy)]
pub(crate) enum StateError {
	/// Attempt to start TLS while TLS is currently being negotiated.
	TlsInProgress,

	/// Attempt to start TLS after TLS has already been established.
	TlsEstablished,

	/// Attempt to start TLS without a context.
	ContextRequired,

	/// Attempt to start TLS from the client side without a peer server name.
	PeerNameRequired,

	/// Attempt to execute an operation which requires a connection, but the
	/// socket is already disconnected or has not fully connected yet.
	NotConnected,

	/// Attempt to reconfigure the TLS client after the handshake began.
	AlreadyStarted,

	/// The state transition panicked in the past and the socket is now in an
	/// indeterminate state.
	Failed,
}

impl fmt::Display for StateError {
	fn fmt<'f>(&self, f: &'f mut fmt::Formatter) -> fmt::Result {
		match self {
			Self::TlsInProgress => f.write_str("invalid operation: TLS handshake in progress"),
			Self::TlsEstablished => f.write_str("invalid operation: TLS already established"),
			Self::ContextRequired => {
				f.write_str("incomplete config: cannot start TLS without a context")
			}
			Self::PeerNameRequired => {
				f.write_str("incomplete config: peer name required to initiate TLS")
			}
			Self::NotConnected => f.write_str("invalid state: not connected"),
			Self::AlreadyStarted => f.write_str("Already started."),
			Self::Failed => f.write_str("connection handle poisoned"),
		}
	}
}

impl std::error::Error for StateError {}

/**
The socket lifecycle.

`Detached → Connecting → Open → {HalfClosedRemote, Shutdown} → Closed`,
with the TLS phase carried inside the connected states. This drives which
operations are currently allowed and which callbacks fire on transitions.
*/
#[derive(Debug, Clone)]
pub(crate) enum SocketState {
	/// Configured but without a transport yet.
	Detached,

	/// An outbound connection attempt is in flight.
	Connecting(PreTlsConfig),

	/// The transport is established in both directions.
	Open(TlsPhase),

	/// The peer closed its writing side; we may still write.
	HalfClosedRemote(TlsPhase),

	/// Locally shut down.
	Shutdown,

	/// Fully closed; terminal.
	Closed,

	/// The connection broke internally during a state change.
	Failed,
}

impl SocketState {
	/// Helper function to make transitions without unnecessary cloning of
	/// the state easier to implement.
	///
	/// **Note:** If `f` panics, the `SocketState` will be set to `Failed`.
	#[inline]
	fn transition_impl<T, F: FnOnce(Self) -> Result<(Self, T), (Self, StateError)>>(
		&mut self,
		f: F,
	) -> Result<T, StateError> {
		let mut tmp = Self::Failed;
		std::mem::swap(&mut tmp, self);
		let result = match f(tmp) {
			Ok((new, v)) => {
				tmp = new;
				Ok(v)
			}
			Err((new, err)) => {
				tmp = new;
				Err(err)
			}
		};
		std::mem::swap(&mut tmp, self);
		result
	}

	/// Confirm a successful transport establishment.
	///
	/// Transitions from `Connecting` to `Open`; any other state is left
	/// alone. Returns true if a transition took place.
	pub(crate) fn connected(&mut self) -> Result<bool, StateError> {
		self.transition_impl(|this| match this {
			Self::Connecting(tls) => Ok((Self::Open(TlsPhase::Plain(tls)), true)),
			_ => Ok((this, false)),
		})
	}

	/// Confirm a completed TLS handshake.
	///
	/// Transitions `Connecting`, `Open` (plain or handshaking) and
	/// `HalfClosedRemote` into the established TLS phase. Returns true if
	/// the transport had not been reported open before.
	pub(crate) fn tls_established(&mut self, info: tls::Info) -> Result<bool, StateError> {
		self.transition_impl(|this| match this {
			Self::Connecting(..) => Ok((Self::Open(TlsPhase::Established(Box::new(info))), true)),
			Self::Open(TlsPhase::Plain(..)) | Self::Open(TlsPhase::Handshaking) => {
				Ok((Self::Open(TlsPhase::Established(Box::new(info))), false))
			}
			Self::HalfClosedRemote(TlsPhase::Plain(..))
			| Self::HalfClosedRemote(TlsPhase::Handshaking) => {
				Ok((Self::HalfClosedRemote(TlsPhase::Established(Box::new(info))), false))
			}
			Self::Open(TlsPhase::Established(..))
			| Self::HalfClosedRemote(TlsPhase::Established(..)) => {
				Err((this, StateError::TlsEstablished))
			}
			Self::Detached | Self::Shutdown | Self::Closed => Err((this, StateError::NotConnected)),
			Self::Failed => Err((this, StateError::Failed)),
		})
	}

	/// The peer sent FIN. Returns true if this is news.
	pub(crate) fn remote_closed(&mut self) -> Result<bool, StateError> {
		self.transition_impl(|this| match this {
			Self::Open(phase) => Ok((Self::HalfClosedRemote(phase), true)),
			_ => Ok((this, false)),
		})
	}

	/// Local shutdown; safely idempotent from any state.
	pub(crate) fn shutdown(&mut self) -> Result<bool, StateError> {
		self.transition_impl(|this| match this {
			Self::Shutdown | Self::Closed => Ok((this, false)),
			_ => Ok((Self::Shutdown, true)),
		})
	}

	/// Mark the socket closed.
	///
	/// Transitions from any state (including Failed!) to `Closed`. Returns
	/// true if the state was previously not `Closed`.
	pub(crate) fn closed(&mut self) -> Result<bool, StateError> {
		self.transition_impl(|this| match this {
			Self::Closed => Ok((this, false)),
			_ => Ok((Self::Closed, true)),
		})
	}

	/// Replace the target server name before the handshake starts.
	pub(crate) fn set_servername(&mut self, name: rustls::ServerName) -> Result<(), StateError> {
		self.transition_impl(|this| match this {
			Self::Connecting(PreTlsConfig::Client(_, cfg)) => {
				Ok((Self::Connecting(PreTlsConfig::Client(name, cfg)), ()))
			}
			Self::Open(TlsPhase::Plain(PreTlsConfig::Client(_, cfg))) => {
				Ok((Self::Open(TlsPhase::Plain(PreTlsConfig::Client(name, cfg))), ()))
			}
			_ => Err((this, StateError::AlreadyStarted)),
		})
	}

	/// Prepare a TLS upgrade on an established plaintext socket.
	///
	/// `given_config` and `given_servername` are optional if and only if
	/// there is a non-None [`PreTlsConfig`] associated with the socket.
	/// On success the state transitions to the handshaking phase and the
	/// [`StartTls`] instruction for the worker is returned.
	pub(crate) fn start_tls(
		&mut self,
		given_config: Option<&tls::TlsConfig>,
		given_servername: Option<rustls::ServerName>,
	) -> Result<StartTls, StateError> {
		self.transition_impl(|this| {
			let phase = match this {
				Self::Open(TlsPhase::Handshaking) => {
					return Err((this, StateError::TlsInProgress))
				}
				Self::Open(TlsPhase::Established(..)) => {
					return Err((this, StateError::TlsEstablished))
				}
				Self::Failed => return Err((this, StateError::Failed)),
				Self::Detached
				| Self::Connecting(..)
				| Self::HalfClosedRemote(..)
				| Self::Shutdown
				| Self::Closed => return Err((this, StateError::NotConnected)),
				Self::Open(TlsPhase::Plain(ref stored)) => stored,
			};

			let msg = match phase {
				PreTlsConfig::None => match given_config {
					Some(tls::TlsConfig::Client(parts)) => match given_servername {
						Some(name) => StartTls::Connect(name, parts.clone()),
						None => return Err((this, StateError::PeerNameRequired)),
					},
					Some(tls::TlsConfig::Server(parts)) => StartTls::Accept(parts.clone()),
					None => return Err((this, StateError::ContextRequired)),
				},
				PreTlsConfig::Server(stored) => match given_config {
					Some(tls::TlsConfig::Client(parts)) => match given_servername {
						Some(name) => StartTls::Connect(name, parts.clone()),
						None => return Err((this, StateError::PeerNameRequired)),
					},
					Some(tls::TlsConfig::Server(parts)) => StartTls::Accept(parts.clone()),
					None => StartTls::Accept(stored.clone()),
				},
				PreTlsConfig::Client(stored_name, stored_cfg) => {
					let name = match given_servername {
						Some(name) => name,
						None => stored_name.clone(),
					};
					match given_config {
						Some(tls::TlsConfig::Client(parts)) => StartTls::Connect(name, parts.clone()),
						Some(tls::TlsConfig::Server(parts)) => StartTls::Accept(parts.clone()),
						None => StartTls::Connect(name, stored_cfg.clone()),
					}
				}
			};

			Ok((Self::Open(TlsPhase::Handshaking), msg))
		})
	}

	pub(crate) fn is_open(&self) -> bool {
		matches!(self, Self::Open(..) | Self::HalfClosedRemote(..))
	}

	pub(crate) fn is_tls(&self) -> bool {
		matches!(
			self,
			Self::Open(TlsPhase::Handshaking)
				| Self::Open(TlsPhase::Established(..))
				| Self::HalfClosedRemote(TlsPhase::Handshaking)
				| Self::HalfClosedRemote(TlsPhase::Established(..))
		)
	}

	pub(crate) fn tls_info(&self) -> Option<&tls::Info> {
		match self {
			Self::Open(TlsPhase::Established(info))
			| Self::HalfClosedRemote(TlsPhase::Established(info)) => Some(info),
			_ => None,
		}
	}

	/// Verifier handles for a not-yet-started TLS config, used by
	/// `set_verify_mode` before the handshake.
	pub(crate) fn pre_tls(&self) -> Option<&PreTlsConfig> {
		match self {
			Self::Connecting(cfg) => Some(cfg),
			Self::Open(TlsPhase::Plain(cfg)) | Self::HalfClosedRemote(TlsPhase::Plain(cfg)) => {
				Some(cfg)
			}
			_ => None,
		}
	}
}


#[cfg(test)]
mod tests {
	use super::*;

	use std::convert::TryFrom;

	fn open_plain() -> SocketState {
		SocketState::Open(TlsPhase::Plain(PreTlsConfig::None))
	}

	#[test]
	fn connect_lifecycle() {
		let mut state = SocketState::Connecting(PreTlsConfig::None);
		assert!(state.connected().unwrap());
		assert!(state.is_open());
		// connected() is a no-op once open
		assert!(!state.connected().unwrap());
		assert!(state.remote_closed().unwrap());
		assert!(matches!(state, SocketState::HalfClosedRemote(..)));
		assert!(state.closed().unwrap());
		assert!(!state.closed().unwrap());
	}

	#[test]
	fn shutdown_is_idempotent() {
		let mut state = open_plain();
		assert!(state.shutdown().unwrap());
		assert!(!state.shutdown().unwrap());
		assert!(state.closed().unwrap());
		// shutdown after close stays closed
		assert!(!state.shutdown().unwrap());
		assert!(matches!(state, SocketState::Closed));
	}

	#[test]
	fn start_tls_requires_context() {
		let mut state = open_plain();
		assert!(matches!(
			state.start_tls(None, None),
			Err(StateError::ContextRequired)
		));
		// the failed attempt must not have consumed the state
		assert!(state.is_open());
	}

	#[test]
	fn start_tls_rejected_while_connecting() {
		let mut state = SocketState::Connecting(PreTlsConfig::None);
		assert!(matches!(
			state.start_tls(None, None),
			Err(StateError::NotConnected)
		));
	}

	#[test]
	fn servername_changes_refused_after_start() {
		let name = rustls::ServerName::try_from("example.com").unwrap();
		let mut state = SocketState::Open(TlsPhase::Handshaking);
		let err = state.set_servername(name).unwrap_err();
		assert_eq!(format!("{}", err), "Already started.");
	}

	#[test]
	fn remote_close_does_not_reopen_shutdown() {
		let mut state = SocketState::Shutdown;
		assert!(!state.remote_closed().unwrap());
		assert!(matches!(state, SocketState::Shutdown));
	}
}
