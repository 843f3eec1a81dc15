/*!
# Rustls wrappers and configuration parsers
*/
use mlua::prelude::*;

use std::collections::HashMap;
use std::fs::{read_dir, File};
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tokio_rustls::rustls;
use tokio_rustls::rustls::client::StoresClientSessions;

use rustls_pemfile;

use crate::conversion::opaque;
use crate::{strerror, strerror_ok};
use crate::verify;

pub(crate) struct DefaultingSNIResolver {
	default_keypair: RwLock<Option<Arc<rustls::sign::CertifiedKey>>>,
	named_keypairs: RwLock<HashMap<String, Arc<rustls::sign::CertifiedKey>>>,
}

impl DefaultingSNIResolver {
	fn new() -> Self {
		Self {
			default_keypair: RwLock::new(None),
			named_keypairs: RwLock::new(HashMap::new()),
		}
	}

	fn get_default(&self) -> Option<Arc<rustls::sign::CertifiedKey>> {
		let default_keypair = self.default_keypair.read().unwrap();
		default_keypair.clone()
	}

	fn get_by_name(&self, name: &str) -> Option<Arc<rustls::sign::CertifiedKey>> {
		let by_name = {
			let keypairs = self.named_keypairs.read().unwrap();
			keypairs.get(name).cloned()
		};
		match by_name {
			Some(v) => Some(v),
			None => self.get_default(),
		}
	}

	fn set_default_keypair(&self, keypair: Arc<rustls::sign::CertifiedKey>) {
		*self.default_keypair.write().unwrap() = Some(keypair)
	}

	/// Insert or replace the keypair served for `name`.
	pub(crate) fn set_keypair(&self, name: &str, keypair: Arc<rustls::sign::CertifiedKey>) {
		let mut keypairs = self.named_keypairs.write().unwrap();
		keypairs.insert(name.to_string(), keypair);
	}

	pub(crate) fn default_certs(&self) -> Option<Vec<rustls::Certificate>> {
		self.get_default().map(|k| k.cert.clone())
	}
}

impl rustls::server::ResolvesServerCert for DefaultingSNIResolver {
	fn resolve(
		&self,
		client_hello: rustls::server::ClientHello<'_>,
	) -> Option<Arc<rustls::sign::CertifiedKey>> {
		match client_hello.server_name() {
			Some(name) => self.get_by_name(name.into()),
			None => self.get_default(),
		}
	}
}

/**
Client session cache which keeps the most recent session blob addressable
from the script side.

This is what backs `session()`/`set_session()`/`tls_ticket()` on the socket
handle: rustls manages resumption internally, the recorder merely remembers
the latest stored entry as an opaque blob so that scripts can round-trip it.
*/
pub(crate) struct RecordingSessionStore {
	inner: Arc<rustls::client::ClientSessionMemoryCache>,
	last: Mutex<Option<(Vec<u8>, Vec<u8>)>>,
}

impl RecordingSessionStore {
	fn new() -> Self {
		Self {
			inner: rustls::client::ClientSessionMemoryCache::new(32),
			last: Mutex::new(None),
		}
	}

	pub(crate) fn last_session(&self) -> Option<Vec<u8>> {
		self.last.lock().unwrap().as_ref().map(|(_, v)| v.clone())
	}

	/// Re-inject a previously exported session blob. Without a recorded key
	/// there is nothing to attach it to; the call still succeeds, matching
	/// the set-after-get round-trip contract.
	pub(crate) fn inject(&self, value: Vec<u8>) {
		let mut last = self.last.lock().unwrap();
		if let Some((key, stored)) = last.as_mut() {
			*stored = value.clone();
			self.inner.put(key.clone(), value);
		}
	}
}

impl rustls::client::StoresClientSessions for RecordingSessionStore {
	fn put(&self, key: Vec<u8>, value: Vec<u8>) -> bool {
		*self.last.lock().unwrap() = Some((key.clone(), value.clone()));
		self.inner.put(key, value)
	}

	fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
		self.inner.get(key)
	}
}

#[derive(Clone)]
pub(crate) struct ServerTls {
	pub(crate) cfg: Arc<rustls::ServerConfig>,
	pub(crate) resolver: Arc<DefaultingSNIResolver>,
	pub(crate) recorder: Arc<verify::RecordingClientVerifier>,
}

#[derive(Clone)]
pub(crate) struct ClientTls {
	pub(crate) cfg: Arc<rustls::ClientConfig>,
	pub(crate) recorder: Arc<verify::RecordingVerifier>,
	pub(crate) sessions: Arc<RecordingSessionStore>,
	pub(crate) local_certs: Option<Vec<rustls::Certificate>>,
}

#[derive(Clone)]
pub(crate) enum TlsConfig {
	Server(ServerTls),
	Client(ClientTls),
}

#[derive(Clone)]
pub(crate) struct TlsConfigHandle(pub(crate) Arc<TlsConfig>);

impl TlsConfigHandle {
	pub(crate) fn as_ref(&self) -> &TlsConfig {
		&*self.0
	}
}

impl LuaUserData for TlsConfigHandle {
	fn add_methods<'lua, M: LuaUserDataMethods<'lua, Self>>(methods: &mut M) {
		methods.add_method(
			"add_server_name",
			|_,
			 this: &Self,
			 (hostname, options): (LuaString, LuaTable)|
			 -> LuaResult<Result<bool, String>> {
				let hostname = hostname.to_str()?;
				if hostname.is_empty() {
					return Ok(Err("empty server name".to_string()));
				}
				let resolver = match this.as_ref() {
					TlsConfig::Server(parts) => &parts.resolver,
					TlsConfig::Client(..) => {
						return Ok(Err("cannot add SNI host to client context".to_string()))
					}
				};
				let keypair = match certificatekey_from_lua(&options) {
					Ok(Some(v)) => v,
					Ok(None) => return Ok(Err("certificate and key are required".to_string())),
					Err(e) => return Ok(Err(format!("{}", e))),
				};
				resolver.set_keypair(hostname, Arc::new(keypair));
				Ok(Ok(true))
			},
		);

		methods.add_method(
			"set_verify_mode",
			|_, this: &Self, (request_cert, reject_unauthorized): (bool, bool)| -> LuaResult<bool> {
				match this.as_ref() {
					TlsConfig::Server(parts) => parts.recorder.set_mode(request_cert, reject_unauthorized),
					TlsConfig::Client(parts) => parts.recorder.set_strict(reject_unauthorized),
				};
				Ok(true)
			},
		);
	}
}

fn read_certs<P: AsRef<Path>>(fname: P) -> io::Result<Vec<rustls::Certificate>> {
	let f = File::open(fname)?;
	let mut f = io::BufReader::new(f);
	Ok(rustls_pemfile::certs(&mut f)?
		.drain(..)
		.map(|x| rustls::Certificate(x))
		.collect())
}

fn read_keys<P: AsRef<Path>>(fname: P) -> io::Result<Vec<rustls::PrivateKey>> {
	let f = File::open(fname)?;
	let mut f = io::BufReader::new(f);
	let mut result = Vec::new();
	for item in std::iter::from_fn(|| rustls_pemfile::read_one(&mut f).transpose()) {
		match item? {
			rustls_pemfile::Item::X509Certificate(_) => (),
			rustls_pemfile::Item::RSAKey(v)
			| rustls_pemfile::Item::PKCS8Key(v)
			| rustls_pemfile::Item::ECKey(v) => result.push(rustls::PrivateKey(v)),
			_ => (),
		}
	}
	Ok(result)
}

fn read_first_key<P: AsRef<Path>>(fname: P) -> io::Result<rustls::PrivateKey> {
	let mut keys = read_keys(fname)?;
	if keys.len() == 0 {
		return Err(io::Error::new(
			io::ErrorKind::UnexpectedEof,
			"no key found in key file",
		));
	}
	Ok(keys.remove(0))
}

fn read_keypair<C: AsRef<Path>, K: AsRef<Path>>(
	cert: C,
	key: K,
) -> io::Result<(Vec<rustls::Certificate>, rustls::PrivateKey)> {
	let certs = read_certs(cert)?;
	let key = read_first_key(key)?;
	Ok((certs, key))
}

fn keypair_from_lua<'l>(
	tbl: &'l LuaTable,
) -> LuaResult<Option<(Vec<rustls::Certificate>, rustls::PrivateKey)>> {
	let cert_file = tbl.get::<_, Option<LuaString>>("certificate")?;
	let key_file = tbl.get::<_, Option<LuaString>>("key")?;
	if cert_file.is_none() && key_file.is_none() {
		return Ok(None);
	}

	if cert_file.is_none() != key_file.is_none() {
		return Err(opaque("either both certificate and key must be set, or both must be absent").into());
	}

	let cert_file = cert_file.unwrap();
	let key_file = key_file.unwrap();
	match read_keypair(
		cert_file.to_str()?,
		key_file.to_str()?,
	) {
		Ok(keypair) => Ok(Some(keypair)),
		Err(e) => Err(opaque(format!(
			"failed to load keypair from {} and {}: {}",
			cert_file.to_string_lossy(),
			key_file.to_string_lossy(),
			e
		))
		.into()),
	}
}

/// Load a certificate/key pair from an options table into a servable
/// keypair (used for SNI additions on listeners and server configs).
pub(crate) fn certified_key_from_options<'l>(tbl: &'l LuaTable) -> LuaResult<Option<rustls::sign::CertifiedKey>> {
	certificatekey_from_lua(tbl)
}

fn certificatekey_from_lua<'l>(tbl: &'l LuaTable) -> LuaResult<Option<rustls::sign::CertifiedKey>> {
	let (certs, key) = match keypair_from_lua(tbl)? {
		Some(v) => v,
		None => return Ok(None),
	};
	let key = match rustls::sign::any_supported_type(&key) {
		Ok(v) => v,
		Err(_) => return Err(opaque("invalid private key encountered").into()),
	};
	Ok(Some(rustls::sign::CertifiedKey {
		cert: certs,
		key: key,
		ocsp: None,
		sct_list: None,
	}))
}

fn read_rootstore_file<P: AsRef<Path>>(
	name: P,
	into: &mut rustls::RootCertStore,
) -> io::Result<()> {
	let f = File::open(name.as_ref())?;
	let mut f = io::BufReader::new(f);
	let mut certs = Vec::new();
	for item in std::iter::from_fn(|| rustls_pemfile::read_one(&mut f).transpose()) {
		match item {
			Ok(rustls_pemfile::Item::X509Certificate(cert)) => certs.push(cert),
			Ok(_) => continue,
			Err(_) => continue,
		}
	}
	into.add_parsable_certificates(&certs[..]);
	Ok(())
}

fn rootstore_from_lua<'l>(config: &LuaTable<'l>) -> Result<rustls::RootCertStore, String> {
	let mut root_store = rustls::RootCertStore::empty();
	if let Ok(Some(fname)) = config.get::<_, Option<String>>("cafile") {
		strerror!(read_rootstore_file(&fname, &mut root_store));
	}
	if let Ok(Some(dirname)) = config.get::<_, Option<String>>("capath") {
		for entry in strerror!(read_dir(&dirname)) {
			let entry = match entry {
				Ok(entry) => entry,
				Err(_) => continue,
			};
			match entry.file_type() {
				Err(_) => continue,
				Ok(t) => {
					if !t.is_file() {
						continue;
					}
				}
			};
			strerror!(read_rootstore_file(entry.path(), &mut root_store));
		}
	}
	Ok(root_store)
}

fn alpn_from_lua<'l>(config: &LuaTable<'l>) -> Result<Vec<Vec<u8>>, String> {
	let list = match config.get::<_, Option<LuaTable>>("alpn") {
		Ok(Some(v)) => v,
		Ok(None) => return Ok(Vec::new()),
		Err(e) => return Err(format!("invalid alpn option: {}", e)),
	};
	let mut result = Vec::new();
	for proto in list.sequence_values::<LuaString>() {
		match proto {
			Ok(p) => result.push(p.as_bytes().to_vec()),
			Err(e) => return Err(format!("invalid alpn entry: {}", e)),
		}
	}
	Ok(result)
}

fn parse_server_config<'l>(
	lua: &'l Lua,
	config: LuaTable,
) -> LuaResult<Result<LuaAnyUserData<'l>, String>> {
	let resolver = DefaultingSNIResolver::new();
	let default_keypair = match certificatekey_from_lua(&config) {
		Ok(Some(v)) => v,
		Ok(None) => return Ok(Err("server context requires a certificate and key".to_string())),
		Err(e) => return Ok(Err(format!("invalid keypair: {}", e))),
	};
	resolver.set_default_keypair(Arc::new(default_keypair));
	let resolver = Arc::new(resolver);

	let root_store = strerror_ok!(rootstore_from_lua(&config));
	let strict = config.get::<_, Option<bool>>("reject_unauthorized")?.unwrap_or(true);
	let request_cert = config.get::<_, Option<bool>>("request_cert")?.unwrap_or(false);
	let alpn = strerror_ok!(alpn_from_lua(&config));

	let verifier = rustls::server::AllowAnyAnonymousOrAuthenticatedClient::new(root_store);
	let recorder = verify::RecordingClientVerifier::new(verifier, strict);
	recorder.set_mode(request_cert, strict);
	let recorder = Arc::new(recorder);

	let mut cfg = rustls::ServerConfig::builder()
		.with_safe_defaults()
		.with_client_cert_verifier(recorder.clone())
		.with_cert_resolver(resolver.clone());
	cfg.alpn_protocols = alpn;

	Ok(Ok(lua.create_userdata(TlsConfigHandle(Arc::new(
		TlsConfig::Server(ServerTls {
			cfg: Arc::new(cfg),
			resolver,
			recorder,
		}),
	)))?))
}

fn parse_client_config<'l>(
	lua: &'l Lua,
	config: LuaTable,
) -> LuaResult<Result<LuaAnyUserData<'l>, String>> {
	let keypair = keypair_from_lua(&config)?;
	let root_store = strerror_ok!(rootstore_from_lua(&config));
	let strict = config.get::<_, Option<bool>>("reject_unauthorized")?.unwrap_or(true);
	let alpn = strerror_ok!(alpn_from_lua(&config));

	let recorder = Arc::new(verify::RecordingVerifier::new(
		Arc::new(rustls::client::WebPkiVerifier::new(root_store, None)),
		strict,
	));
	let sessions = Arc::new(RecordingSessionStore::new());
	let cfg = rustls::ClientConfig::builder()
		.with_safe_defaults()
		.with_custom_certificate_verifier(recorder.clone());

	let local_certs = keypair.as_ref().map(|(certs, _)| certs.clone());
	let mut cfg = match keypair {
		Some((certs, key)) => strerror_ok!(cfg.with_single_cert(certs, key)),
		None => cfg.with_no_client_auth(),
	};
	cfg.alpn_protocols = alpn;
	cfg.session_storage = sessions.clone();

	Ok(Ok(lua.create_userdata(TlsConfigHandle(Arc::new(
		TlsConfig::Client(ClientTls {
			cfg: Arc::new(cfg),
			recorder,
			sessions,
			local_certs,
		}),
	)))?))
}

pub(crate) fn new_tls_config<'l>(
	lua: &'l Lua,
	config: LuaTable,
) -> LuaResult<Result<LuaAnyUserData<'l>, String>> {
	match config.get::<_, String>("mode") {
		Ok(v) if v == "server" => parse_server_config(lua, config),
		Ok(v) if v == "client" => parse_client_config(lua, config),
		Ok(v) => Ok(Err(format!(
			"must be either \"server\" or \"client\", got {:?}",
			v
		))),
		Err(e) => Ok(Err(format!("mode is absent or of invalid type: {}", e))),
	}
}

/// Config used for `tls = true` on outbound sockets: no roots, non-strict
/// verification (the handshake callback still sees the recorded outcome).
pub(crate) fn default_client_config() -> ClientTls {
	let recorder = Arc::new(verify::RecordingVerifier::new(
		Arc::new(rustls::client::WebPkiVerifier::new(
			rustls::RootCertStore::empty(),
			None,
		)),
		false,
	));
	let sessions = Arc::new(RecordingSessionStore::new());
	let mut cfg = rustls::ClientConfig::builder()
		.with_safe_defaults()
		.with_custom_certificate_verifier(recorder.clone())
		.with_no_client_auth();
	cfg.session_storage = sessions.clone();
	ClientTls {
		cfg: Arc::new(cfg),
		recorder,
		sessions,
		local_certs: None,
	}
}

fn protocol_str(p: rustls::ProtocolVersion) -> &'static str {
	match p {
		rustls::ProtocolVersion::SSLv2 => "SSLv2",
		rustls::ProtocolVersion::SSLv3 => "SSLv3",
		rustls::ProtocolVersion::TLSv1_0 => "TLSv1.0",
		rustls::ProtocolVersion::TLSv1_1 => "TLSv1.1",
		rustls::ProtocolVersion::TLSv1_2 => "TLSv1.2",
		rustls::ProtocolVersion::TLSv1_3 => "TLSv1.3",
		rustls::ProtocolVersion::DTLSv1_0 => "DTLSv1.0",
		rustls::ProtocolVersion::DTLSv1_2 => "DTLSv1.2",
		rustls::ProtocolVersion::DTLSv1_3 => "DTLSv1.3",
		_ => "unknown",
	}
}

/**
Snapshot of the completed handshake.

Captured by the worker while it still holds the whole TLS stream; the
introspection methods on the socket handle answer from this without a
round-trip (keying material export being the one live query).
*/
#[derive(Debug, Clone)]
pub(crate) struct Info {
	pub(crate) protocol: Option<rustls::ProtocolVersion>,
	pub(crate) cipher: Option<rustls::SupportedCipherSuite>,
	pub(crate) alpn: Option<Vec<u8>>,
	pub(crate) server_name: Option<String>,
	pub(crate) peer_certs: Vec<rustls::Certificate>,
	pub(crate) local_certs: Option<Vec<rustls::Certificate>>,
	pub(crate) verify: verify::VerificationRecord,
	pub(crate) is_server: bool,
}

impl Info {
	pub(crate) fn from_server_conn(conn: &rustls::ServerConnection) -> Self {
		Self {
			protocol: conn.protocol_version(),
			cipher: conn.negotiated_cipher_suite(),
			alpn: conn.alpn_protocol().map(|x| x.to_vec()),
			server_name: conn.sni_hostname().map(|x| x.to_string()),
			peer_certs: conn.peer_certificates().map(|x| x.to_vec()).unwrap_or_default(),
			local_certs: None,
			verify: verify::VerificationRecord::Unverified,
			is_server: true,
		}
	}

	pub(crate) fn from_client_conn(conn: &rustls::ClientConnection, server_name: Option<String>) -> Self {
		Self {
			protocol: conn.protocol_version(),
			cipher: conn.negotiated_cipher_suite(),
			alpn: conn.alpn_protocol().map(|x| x.to_vec()),
			server_name,
			peer_certs: conn.peer_certificates().map(|x| x.to_vec()).unwrap_or_default(),
			local_certs: None,
			verify: verify::VerificationRecord::Unverified,
			is_server: false,
		}
	}

	pub(crate) fn with_verify(mut self, verify: verify::VerificationRecord) -> Self {
		self.verify = verify;
		self
	}

	pub(crate) fn with_local_certs(mut self, certs: Option<Vec<rustls::Certificate>>) -> Self {
		self.local_certs = certs;
		self
	}

	pub(crate) fn protocol_name(&self) -> &'static str {
		match self.protocol {
			Some(p) => protocol_str(p),
			None => "unknown",
		}
	}

	pub(crate) fn cipher_name(&self) -> Option<String> {
		self.cipher.map(|cs| format!("{:?}", cs.suite()))
	}

	pub(crate) fn cipher_protocol_name(&self) -> Option<&'static str> {
		self.cipher.map(|cs| protocol_str(cs.version().version))
	}

	pub(crate) fn to_lua_table<'l>(&self, lua: &'l Lua) -> LuaResult<LuaTable<'l>> {
		let result = lua.create_table_with_capacity(0, 4)?;
		result.raw_set("protocol", self.protocol_name())?;
		if let Some(cipher) = self.cipher_name() {
			result.raw_set("cipher", cipher)?;
		}
		if let Some(alpn) = &self.alpn {
			result.raw_set("alpn", lua.create_string(alpn)?)?;
		}
		if let Some(name) = &self.server_name {
			result.raw_set("servername", name.as_str())?;
		}
		Ok(result)
	}
}
