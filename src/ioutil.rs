use std::io;
use std::time::{Duration, Instant};

use tokio::time::{timeout, timeout_at};


#[inline]
pub(crate) async fn iotimeout<T, F: std::future::Future<Output = io::Result<T>>>(t: Duration, f: F, msg: &'static str) -> io::Result<T> {
	match timeout(t, f).await {
		Ok(r) => r,
		Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, msg)),
	}
}


#[inline]
pub(crate) async fn iodeadline<T, F: std::future::Future<Output = io::Result<T>>>(t: Instant, f: F, msg: &'static str) -> io::Result<T> {
	match timeout_at(t.into(), f).await {
		Ok(r) => r,
		Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, msg)),
	}
}
