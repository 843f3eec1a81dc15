/*!
# Recording of verification results during TLS handshake

The handshake callback surfaces `(authorized, verify_error)` to the script.
rustls invokes its verifier deep inside the handshake future; the recorders
here capture the outcome in a task-local so the worker can attach it to the
handshake completion message.
*/
use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task_local;

use tokio_rustls::rustls;


#[derive(Debug, Clone)]
pub(crate) enum VerificationRecord {
	Unverified,
	Passed{cert: rustls::Certificate},
	Failed{err: rustls::Error},
}

impl Default for VerificationRecord {
	fn default() -> Self {
		Self::Unverified
	}
}

impl VerificationRecord {
	/// The `authorized` flag of the handshake callback: the most recent
	/// verification passed.
	pub(crate) fn authorized(&self) -> bool {
		matches!(self, Self::Passed{..})
	}

	pub(crate) fn error_text(&self) -> Option<String> {
		match self {
			Self::Failed{err} => Some(format!("{}", err)),
			_ => None,
		}
	}

	pub(crate) fn peer_cert(&self) -> Option<&rustls::Certificate> {
		match self {
			Self::Passed{cert} => Some(cert),
			_ => None,
		}
	}
}

task_local! {
	// we use a ref cell to make things fail loudly if reentrant access is happening.
	static CURRENT_VERIFIER: RefCell<VerificationRecord>;
}

pub(crate) struct RecordingVerifier {
	inner: Arc<dyn rustls::client::ServerCertVerifier>,
	strict: AtomicBool,
}

impl RecordingVerifier {
	pub(crate) fn new(inner: Arc<dyn rustls::client::ServerCertVerifier>, strict: bool) -> Self {
		Self{inner, strict: AtomicBool::new(strict)}
	}

	/// Adjust whether a failed verification aborts the handshake. Only
	/// meaningful before the handshake has started; the engine enforces
	/// that.
	pub(crate) fn set_strict(&self, strict: bool) {
		self.strict.store(strict, Ordering::SeqCst);
	}

	pub(crate) async fn scope<F: Future>(&self, f: F) -> (VerificationRecord, F::Output) {
		CURRENT_VERIFIER.scope(RefCell::new(VerificationRecord::default()), async move {
			let result = f.await;
			(CURRENT_VERIFIER.with(|x| { x.take() }), result)
		}).await
	}
}

impl rustls::client::ServerCertVerifier for RecordingVerifier {
	fn verify_server_cert(
		&self,
		end_entity: &rustls::Certificate,
		intermediates: &[rustls::Certificate],
		server_name: &rustls::ServerName,
		scts: &mut dyn Iterator<Item = &[u8]>,
		ocsp_response: &[u8],
		now: std::time::SystemTime,
	) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
		CURRENT_VERIFIER.with(|x| {
			let (record, result) = match self.inner.verify_server_cert(
				end_entity,
				intermediates,
				server_name,
				scts,
				ocsp_response,
				now,
			) {
				Ok(r) => {
					let cert = end_entity.clone();
					(VerificationRecord::Passed{cert}, Ok(r))
				},
				Err(e) => (VerificationRecord::Failed{err: e.clone()}, Err(e)),
			};
			*x.borrow_mut() = record;
			if self.strict.load(Ordering::SeqCst) {
				result
			} else {
				Ok(rustls::client::ServerCertVerified::assertion())
			}
		})
	}
}

pub(crate) struct RecordingClientVerifier {
	inner: Arc<dyn rustls::server::ClientCertVerifier>,
	strict: AtomicBool,
	request: AtomicBool,
}

impl RecordingClientVerifier {
	pub(crate) fn new(inner: Arc<dyn rustls::server::ClientCertVerifier>, strict: bool) -> Self {
		Self{
			inner,
			strict: AtomicBool::new(strict),
			request: AtomicBool::new(true),
		}
	}

	/// `request` controls whether a client certificate is solicited at all,
	/// `strict` whether an unverifiable one aborts the handshake.
	pub(crate) fn set_mode(&self, request: bool, strict: bool) {
		self.request.store(request, Ordering::SeqCst);
		self.strict.store(strict, Ordering::SeqCst);
	}

	pub(crate) async fn scope<F: Future>(&self, f: F) -> (VerificationRecord, F::Output) {
		CURRENT_VERIFIER.scope(RefCell::new(VerificationRecord::default()), async move {
			let result = f.await;
			(CURRENT_VERIFIER.with(|x| { x.take() }), result)
		}).await
	}
}

impl rustls::server::ClientCertVerifier for RecordingClientVerifier {
	fn client_auth_mandatory(&self) -> Option<bool> {
		match self.inner.client_auth_mandatory() {
			Some(mandatory) => Some(mandatory && self.strict.load(Ordering::SeqCst)),
			None => None,
		}
	}

	fn offer_client_auth(&self) -> bool {
		self.inner.offer_client_auth() && self.request.load(Ordering::SeqCst)
	}

	fn client_auth_root_subjects(&self) -> Option<Vec<rustls::internal::msgs::base::PayloadU16>> {
		// We never tell the peer which certificates we accept ... Otherwise it would be an awfully long list in the general case.
		Some(Vec::new())
	}

	fn verify_client_cert(
		&self,
		end_entity: &rustls::Certificate,
		intermediates: &[rustls::Certificate],
		now: std::time::SystemTime,
	) -> Result<rustls::server::ClientCertVerified, rustls::Error> {
		CURRENT_VERIFIER.with(|x| {
			let (record, result) = match self.inner.verify_client_cert(end_entity, intermediates, now) {
				Ok(r) => {
					let cert = end_entity.clone();
					(VerificationRecord::Passed{cert}, Ok(r))
				},
				Err(e) => (VerificationRecord::Failed{err: e.clone()}, Err(e)),
			};
			*x.borrow_mut() = record;
			if self.strict.load(Ordering::SeqCst) {
				result
			} else {
				Ok(rustls::server::ClientCertVerified::assertion())
			}
		})
	}
}
