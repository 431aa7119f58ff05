//! Outbound signed HTTP through a SOCKS5 (Tor) proxy (§4.2/§5). Every signed call is
//! blocking on its worker with a 10-s timeout; callers observe the result on a queued
//! channel rather than blocking the session's main context.

use crate::auth::{self, SignedHeaders};
use crate::error::{Result, WalletError};
use crate::identity::Identity;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use hyper_socks2::SocksConnector;
use hyper_timeout::TimeoutConnector;
use std::collections::HashMap;
use std::time::Duration;

pub const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_RESPONSE_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone)]
pub struct SignedResponse {
	pub status: u16,
	pub body: Vec<u8>,
}

impl SignedResponse {
	pub fn json(&self) -> Result<serde_json::Value> {
		serde_json::from_slice(&self.body).map_err(WalletError::from)
	}
}

/// Capability handle for reaching peers over Tor. Mocked in tests so session logic
/// can run without a real SOCKS5 proxy.
#[async_trait]
pub trait TorTransport: Send + Sync {
	async fn get_signed(&self, identity: &Identity, onion: &str, path: &str, reference: &str) -> Result<SignedResponse>;

	/// Like [`get_signed`](Self::get_signed) but for endpoints that carry `stage`/`i` in
	/// their signed query (the multisig blob-fetch endpoint).
	async fn get_blob(
		&self,
		identity: &Identity,
		onion: &str,
		reference: &str,
		stage: &str,
		round: u32,
	) -> Result<SignedResponse>;

	async fn post_signed(
		&self,
		identity: &Identity,
		onion: &str,
		path: &str,
		reference: &str,
		body: &[u8],
	) -> Result<SignedResponse>;

	/// Like [`get_signed`](Self::get_signed) but for `/transfer/status`, which also
	/// signs a `transfer_ref` query parameter alongside `ref`.
	async fn get_transfer_status(&self, identity: &Identity, onion: &str, reference: &str, transfer_ref: &str) -> Result<SignedResponse>;
}

pub struct HttpTorTransport {
	socks5_addr: String,
}

impl HttpTorTransport {
	pub fn new(socks5_addr: impl Into<String>) -> Self {
		HttpTorTransport {
			socks5_addr: socks5_addr.into(),
		}
	}

	fn client(&self) -> Result<Client<TimeoutConnector<SocksConnector<HttpConnector>>>> {
		let mut http = HttpConnector::new();
		http.enforce_http(false);
		let socks = SocksConnector {
			proxy_addr: self
				.socks5_addr
				.parse()
				.map_err(|e| WalletError::Transport(format!("bad socks5 addr: {e}")))?,
			auth: None,
			connector: http,
		};
		let mut timeout = TimeoutConnector::new(socks);
		timeout.set_connect_timeout(Some(OUTBOUND_TIMEOUT));
		timeout.set_read_timeout(Some(OUTBOUND_TIMEOUT));
		timeout.set_write_timeout(Some(OUTBOUND_TIMEOUT));
		Ok(Client::builder().build(timeout))
	}

	async fn send(&self, request: Request<Body>) -> Result<SignedResponse> {
		let client = self.client()?;
		let response = client
			.request(request)
			.await
			.map_err(|e| WalletError::Transport(e.to_string()))?;
		let status = response.status().as_u16();
		let body = hyper::body::to_bytes(response.into_body())
			.await
			.map_err(|e| WalletError::Transport(e.to_string()))?;
		if body.len() as u64 > MAX_RESPONSE_BYTES {
			return Err(WalletError::Transport("response too large".into()));
		}
		Ok(SignedResponse {
			status,
			body: body.to_vec(),
		})
	}
}

fn apply_signed_headers(builder: hyper::http::request::Builder, headers: &SignedHeaders) -> hyper::http::request::Builder {
	headers
		.to_vec()
		.into_iter()
		.fold(builder, |b, (k, v)| b.header(k, v))
}

#[async_trait]
impl TorTransport for HttpTorTransport {
	async fn get_signed(&self, identity: &Identity, onion: &str, path: &str, reference: &str) -> Result<SignedResponse> {
		let mut params = HashMap::new();
		params.insert("ref".to_string(), reference.to_string());
		let canon = auth::canonical_path(path, &params)?;
		let uri = format!("http://{onion}{path}?ref={reference}");
		let signed = auth::sign_get(identity, reference, &canon)?;

		let request = apply_signed_headers(
			Request::builder().method("GET").uri(uri),
			&signed,
		)
		.body(Body::empty())
		.map_err(|e| WalletError::Transport(e.to_string()))?;

		self.send(request).await
	}

	async fn get_blob(
		&self,
		identity: &Identity,
		onion: &str,
		reference: &str,
		stage: &str,
		round: u32,
	) -> Result<SignedResponse> {
		let mut params = HashMap::new();
		params.insert("ref".to_string(), reference.to_string());
		params.insert("stage".to_string(), stage.to_string());
		params.insert("i".to_string(), round.to_string());
		let canon = auth::canonical_path("/api/multisig/blob", &params)?;
		let uri = format!("http://{onion}/api/multisig/blob?ref={reference}&stage={stage}&i={round}");
		let signed = auth::sign_get(identity, reference, &canon)?;

		let request = apply_signed_headers(Request::builder().method("GET").uri(uri), &signed)
			.body(Body::empty())
			.map_err(|e| WalletError::Transport(e.to_string()))?;

		self.send(request).await
	}

	async fn post_signed(
		&self,
		identity: &Identity,
		onion: &str,
		path: &str,
		reference: &str,
		body: &[u8],
	) -> Result<SignedResponse> {
		let mut params = HashMap::new();
		params.insert("ref".to_string(), reference.to_string());
		let canon = auth::canonical_path(path, &params)?;
		let uri = format!("http://{onion}{path}?ref={reference}");
		let signed = auth::sign_post(identity, reference, &canon, body)?;

		let request = apply_signed_headers(
			Request::builder().method("POST").uri(uri).header("content-type", "application/json"),
			&signed,
		)
		.body(Body::from(body.to_vec()))
		.map_err(|e| WalletError::Transport(e.to_string()))?;

		self.send(request).await
	}

	async fn get_transfer_status(&self, identity: &Identity, onion: &str, reference: &str, transfer_ref: &str) -> Result<SignedResponse> {
		let mut params = HashMap::new();
		params.insert("ref".to_string(), reference.to_string());
		params.insert("transfer_ref".to_string(), transfer_ref.to_string());
		let canon = auth::canonical_path("/api/multisig/transfer/status", &params)?;
		let uri = format!("http://{onion}/api/multisig/transfer/status?ref={reference}&transfer_ref={transfer_ref}");
		let signed = auth::sign_get(identity, reference, &canon)?;

		let request = apply_signed_headers(Request::builder().method("GET").uri(uri), &signed)
			.body(Body::empty())
			.map_err(|e| WalletError::Transport(e.to_string()))?;

		self.send(request).await
	}
}

#[cfg(test)]
pub mod mock {
	use super::*;
	use std::sync::Mutex;

	/// Records calls and returns canned responses keyed by `(onion, path)`, so session
	/// tests can run without any real network or Tor process.
	#[derive(Default)]
	pub struct MockTransport {
		pub responses: Mutex<HashMap<(String, String), SignedResponse>>,
		pub calls: Mutex<Vec<(String, String)>>,
	}

	impl MockTransport {
		pub fn set_response(&self, onion: &str, path: &str, response: SignedResponse) {
			self.responses
				.lock()
				.unwrap()
				.insert((onion.to_string(), path.to_string()), response);
		}
	}

	#[async_trait]
	impl TorTransport for MockTransport {
		async fn get_signed(&self, _identity: &Identity, onion: &str, path: &str, _reference: &str) -> Result<SignedResponse> {
			self.calls.lock().unwrap().push((onion.to_string(), path.to_string()));
			self.responses
				.lock()
				.unwrap()
				.get(&(onion.to_string(), path.to_string()))
				.cloned()
				.ok_or_else(|| WalletError::Transport("no mock response configured".into()))
		}

		async fn get_blob(
			&self,
			_identity: &Identity,
			onion: &str,
			_reference: &str,
			stage: &str,
			round: u32,
		) -> Result<SignedResponse> {
			let path = format!("/api/multisig/blob?stage={stage}&i={round}");
			self.calls.lock().unwrap().push((onion.to_string(), path.clone()));
			self.responses
				.lock()
				.unwrap()
				.get(&(onion.to_string(), path))
				.cloned()
				.ok_or_else(|| WalletError::Transport("no mock response configured".into()))
		}

		async fn post_signed(
			&self,
			_identity: &Identity,
			onion: &str,
			path: &str,
			_reference: &str,
			_body: &[u8],
		) -> Result<SignedResponse> {
			self.calls.lock().unwrap().push((onion.to_string(), path.to_string()));
			self.responses
				.lock()
				.unwrap()
				.get(&(onion.to_string(), path.to_string()))
				.cloned()
				.ok_or_else(|| WalletError::Transport("no mock response configured".into()))
		}

		async fn get_transfer_status(&self, _identity: &Identity, onion: &str, _reference: &str, transfer_ref: &str) -> Result<SignedResponse> {
			let path = format!("/api/multisig/transfer/status?transfer_ref={transfer_ref}");
			self.calls.lock().unwrap().push((onion.to_string(), path.clone()));
			self.responses
				.lock()
				.unwrap()
				.get(&(onion.to_string(), path))
				.cloned()
				.ok_or_else(|| WalletError::Transport("no mock response configured".into()))
		}
	}
}

#[cfg(test)]
mod tests {
	use super::mock::MockTransport;
	use super::*;
	use crate::identity::Identity;

	#[tokio::test]
	async fn mock_transport_returns_configured_response() {
		let transport = MockTransport::default();
		transport.set_response(
			"abc.onion",
			"/api/ping",
			SignedResponse {
				status: 200,
				body: br#"{"ref":"T"}"#.to_vec(),
			},
		);
		let identity = Identity::generate("x").unwrap();
		let response = transport
			.get_signed(&identity, "abc.onion", "/api/ping", "T")
			.await
			.unwrap();
		assert_eq!(response.status, 200);
		assert_eq!(response.json().unwrap()["ref"], "T");
	}
}
