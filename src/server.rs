//! Minimal hand-rolled HTTP/1.0 server bound to localhost, one per owned onion
//! identity (§4.2). Not a framework: a raw parser with hard size/line/time limits,
//! because the Tor service in front of it is the only thing that ever needs to be
//! convinced this is HTTP at all.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

pub const MAX_HEADER_BYTES: usize = 32 * 1024;
pub const MAX_HEADER_LINES: usize = 200;
pub const MAX_BODY_BYTES: usize = 512 * 1024;
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct InboundRequest {
	pub method: String,
	pub path: String,
	pub query: HashMap<String, String>,
	pub headers: HashMap<String, String>,
	pub body: Vec<u8>,
}

pub struct InboundResponse {
	pub status: u16,
	pub content_type: &'static str,
	pub body: Vec<u8>,
}

impl InboundResponse {
	pub fn plain(status: u16, text: &str) -> Self {
		InboundResponse {
			status,
			content_type: "text/plain",
			body: text.as_bytes().to_vec(),
		}
	}

	pub fn json(status: u16, value: &serde_json::Value) -> Self {
		InboundResponse {
			status,
			content_type: "application/json",
			body: serde_json::to_vec(value).expect("serde_json::Value always serializes"),
		}
	}
}

fn status_text(status: u16) -> &'static str {
	match status {
		200 => "OK",
		201 => "Created",
		404 => "Not Found",
		503 => "Service Unavailable",
		_ => "Error",
	}
}

/// Handles one parsed request and returns the response to write back. Implemented by
/// the router; kept trait-bound so the listener has zero knowledge of session/account
/// state.
#[async_trait]
pub trait RequestHandler: Send + Sync {
	async fn handle(&self, request: InboundRequest) -> InboundResponse;
}

pub struct InboundServer<H: RequestHandler> {
	handler: H,
}

impl<H: RequestHandler + 'static> InboundServer<H> {
	pub fn new(handler: H) -> Self {
		InboundServer { handler }
	}

	pub async fn serve(self: std::sync::Arc<Self>, bind_addr: &str) -> std::io::Result<()> {
		let listener = TcpListener::bind(bind_addr).await?;
		loop {
			let (socket, _addr) = listener.accept().await?;
			let server = self.clone();
			tokio::spawn(async move {
				if let Err(e) = timeout(REQUEST_TIMEOUT, server.handle_connection(socket)).await {
					log::debug!("connection timed out: {e}");
				}
			});
		}
	}

	async fn handle_connection(&self, mut socket: TcpStream) {
		match read_request(&mut socket).await {
			Ok(request) => {
				let response = self.handler.handle(request).await;
				let _ = write_response(&mut socket, &response).await;
			}
			Err(rejection) => {
				let response = InboundResponse::plain(rejection.status, rejection.body);
				let _ = write_response(&mut socket, &response).await;
			}
		}
	}
}

struct Rejection {
	status: u16,
	body: &'static str,
}

fn reject_not_found() -> Rejection {
	Rejection {
		status: 404,
		body: "Not found",
	}
}

async fn read_request(socket: &mut TcpStream) -> Result<InboundRequest, Rejection> {
	let mut buf = Vec::new();
	let mut chunk = [0u8; 4096];
	let header_end = loop {
		let n = socket.read(&mut chunk).await.map_err(|_| reject_not_found())?;
		if n == 0 {
			return Err(reject_not_found());
		}
		buf.extend_from_slice(&chunk[..n]);
		if buf.len() > MAX_HEADER_BYTES && find_header_end(&buf).is_none() {
			return Err(reject_not_found());
		}
		if let Some(pos) = find_header_end(&buf) {
			break pos;
		}
	};

	let header_bytes = &buf[..header_end];
	let header_text = std::str::from_utf8(header_bytes).map_err(|_| reject_not_found())?;
	if header_text.split("\r\n").count() > MAX_HEADER_LINES {
		return Err(reject_not_found());
	}
	let mut lines = header_text.split("\r\n").filter(|l| !l.is_empty());

	let request_line = lines.next().ok_or_else(reject_not_found)?;
	let mut parts = request_line.split_whitespace();
	let method = parts.next().ok_or_else(reject_not_found)?.to_string();
	let raw_path = parts.next().ok_or_else(reject_not_found)?.to_string();

	let mut headers = HashMap::new();
	for line in lines {
		if let Some((k, v)) = line.split_once(':') {
			headers.insert(k.trim().to_ascii_lowercase(), v.trim().to_string());
		}
	}

	let content_length: usize = headers
		.get("content-length")
		.and_then(|v| v.parse().ok())
		.unwrap_or(0);
	if content_length > MAX_BODY_BYTES {
		return Err(reject_not_found());
	}

	if method == "POST" {
		let content_type_ok = headers
			.get("content-type")
			.map(|ct| ct.starts_with("application/json"))
			.unwrap_or(false);
		if !content_type_ok {
			return Err(reject_not_found());
		}
	}

	let already_read = buf.len() - (header_end + 4);
	let mut body = buf[header_end + 4..].to_vec();
	if already_read < content_length {
		let remaining = content_length - already_read;
		let mut rest = vec![0u8; remaining];
		socket.read_exact(&mut rest).await.map_err(|_| reject_not_found())?;
		body.extend_from_slice(&rest);
	}
	body.truncate(content_length);

	let (path, query) = split_query(&raw_path);

	Ok(InboundRequest {
		method,
		path,
		query,
		headers,
		body,
	})
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
	buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn split_query(raw_path: &str) -> (String, HashMap<String, String>) {
	match raw_path.split_once('?') {
		Some((path, query)) => {
			let mut map = HashMap::new();
			for pair in query.split('&') {
				if pair.is_empty() {
					continue;
				}
				match pair.split_once('=') {
					Some((k, v)) => {
						map.insert(k.to_string(), v.to_string());
					}
					None => {
						map.insert(pair.to_string(), String::new());
					}
				}
			}
			(path.to_string(), map)
		}
		None => (raw_path.to_string(), HashMap::new()),
	}
}

async fn write_response(socket: &mut TcpStream, response: &InboundResponse) -> std::io::Result<()> {
	let head = format!(
		"HTTP/1.0 {} {}\r\nConnection: close\r\nContent-Type: {}\r\nCache-Control: no-store\r\nContent-Length: {}\r\n\r\n",
		response.status,
		status_text(response.status),
		response.content_type,
		response.body.len()
	);
	socket.write_all(head.as_bytes()).await?;
	socket.write_all(&response.body).await?;
	socket.shutdown().await
}

#[cfg(test)]
pub mod mock {
	use super::*;

	pub struct EchoHandler;

	#[async_trait]
	impl RequestHandler for EchoHandler {
		async fn handle(&self, request: InboundRequest) -> InboundResponse {
			InboundResponse::json(
				200,
				&serde_json::json!({ "method": request.method, "path": request.path }),
			)
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn split_query_extracts_known_keys() {
		let (path, query) = split_query("/api/multisig/blob?ref=T&stage=KEX&i=1");
		assert_eq!(path, "/api/multisig/blob");
		assert_eq!(query.get("ref").unwrap(), "T");
		assert_eq!(query.get("stage").unwrap(), "KEX");
		assert_eq!(query.get("i").unwrap(), "1");
	}

	#[test]
	fn split_query_handles_no_query_string() {
		let (path, query) = split_query("/api/ping");
		assert_eq!(path, "/api/ping");
		assert!(query.is_empty());
	}
}
