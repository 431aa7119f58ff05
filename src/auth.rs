//! Canonical path+body hashing, header construction/verification, and the replay
//! cache that gates every peer interaction (§4.1 of the design).

use crate::crypto;
use crate::error::{Result, WalletError};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub const TS_SKEW_SECS: i64 = 60;
pub const REPLAY_TTL_SECS: i64 = 300;
pub const REPLAY_CAP: usize = 4096;

pub struct SignedHeaders {
	pub pub_b64: String,
	pub ts: i64,
	pub sig_b64: String,
}

impl SignedHeaders {
	pub fn to_vec(&self) -> Vec<(&'static str, String)> {
		vec![
			("x-pub", self.pub_b64.clone()),
			("x-ts", self.ts.to_string()),
			("x-sig", self.sig_b64.clone()),
		]
	}
}

#[derive(Serialize)]
struct GetMessage<'a> {
	#[serde(rename = "ref")]
	reference: &'a str,
	path: &'a str,
	ts: i64,
}

#[derive(Serialize)]
struct PostMessage<'a> {
	#[serde(rename = "ref")]
	reference: &'a str,
	path: &'a str,
	ts: i64,
	body: String,
}

/// Builds the canonical signed path from a raw query string's known keys, in the
/// fixed order `ref`, `stage`, `i`, `transfer_ref`. `ref` is mandatory; the others are
/// appended only if present. No other query key may appear on a signed request.
pub fn canonical_path(path_no_query: &str, params: &HashMap<String, String>) -> Result<String> {
	let allowed: &[&str] = &["ref", "stage", "i", "transfer_ref"];
	for key in params.keys() {
		if !allowed.contains(&key.as_str()) {
			return Err(WalletError::auth_failed(format!("unexpected query key {key}")));
		}
	}
	let reference = params
		.get("ref")
		.ok_or_else(|| WalletError::auth_failed("missing ref"))?;

	let mut out = format!("{path_no_query}?ref={reference}");
	if let Some(stage) = params.get("stage") {
		out.push_str(&format!("&stage={stage}"));
	}
	if let Some(i) = params.get("i") {
		out.push_str(&format!("&i={i}"));
	}
	if let Some(transfer_ref) = params.get("transfer_ref") {
		out.push_str(&format!("&transfer_ref={transfer_ref}"));
	}
	Ok(out)
}

fn get_message_bytes(reference: &str, path: &str, ts: i64) -> Vec<u8> {
	serde_json::to_vec(&GetMessage { reference, path, ts }).expect("GetMessage always serializes")
}

fn post_message_bytes(reference: &str, path: &str, ts: i64, body: &[u8]) -> Vec<u8> {
	let body_hash = crypto::sha256_hex(body);
	serde_json::to_vec(&PostMessage {
		reference,
		path,
		ts,
		body: body_hash,
	})
	.expect("PostMessage always serializes")
}

pub fn now_secs() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock before epoch")
		.as_secs() as i64
}

/// Signs a GET request for `reference`/`canonical_path` with `identity`.
pub fn sign_get(identity: &crate::identity::Identity, reference: &str, canonical_path: &str) -> Result<SignedHeaders> {
	let ts = now_secs();
	let msg = get_message_bytes(reference, canonical_path, ts);
	let sig = identity.sign(&msg)?;
	Ok(SignedHeaders {
		pub_b64: crypto::b64url_encode(identity.pubkey()),
		ts,
		sig_b64: crypto::b64url_encode(&sig),
	})
}

pub fn sign_post(
	identity: &crate::identity::Identity,
	reference: &str,
	canonical_path: &str,
	body: &[u8],
) -> Result<SignedHeaders> {
	let ts = now_secs();
	let msg = post_message_bytes(reference, canonical_path, ts, body);
	let sig = identity.sign(&msg)?;
	Ok(SignedHeaders {
		pub_b64: crypto::b64url_encode(identity.pubkey()),
		ts,
		sig_b64: crypto::b64url_encode(&sig),
	})
}

pub struct VerifiedRequest {
	pub caller_pub: [u8; 32],
	pub caller_onion: String,
}

/// Verifies a GET request's headers against `reference`/`canonical_path`. Never
/// distinguishes failure reasons on the wire (callers return a uniform 404); the
/// `why` string is for local logging only.
pub fn verify_get(
	headers: &HashMap<String, String>,
	reference: &str,
	canonical_path: &str,
) -> std::result::Result<VerifiedRequest, String> {
	let msg = get_message_bytes(reference, canonical_path, parse_ts(headers)?);
	verify_common(headers, &msg)
}

pub fn verify_post(
	headers: &HashMap<String, String>,
	reference: &str,
	canonical_path: &str,
	body: &[u8],
) -> std::result::Result<VerifiedRequest, String> {
	let msg = post_message_bytes(reference, canonical_path, parse_ts(headers)?, body);
	verify_common(headers, &msg)
}

fn parse_ts(headers: &HashMap<String, String>) -> std::result::Result<i64, String> {
	headers
		.get("x-ts")
		.ok_or_else(|| "missing x-ts".to_string())?
		.parse::<i64>()
		.map_err(|_| "bad x-ts".to_string())
}

fn verify_common(headers: &HashMap<String, String>, msg: &[u8]) -> std::result::Result<VerifiedRequest, String> {
	let pub_hdr = headers.get("x-pub").ok_or("missing x-pub")?;
	let sig_hdr = headers.get("x-sig").ok_or("missing x-sig")?;
	let ts_hdr = headers.get("x-ts").ok_or("missing x-ts")?;
	let ts: i64 = ts_hdr.parse().map_err(|_| "bad x-ts".to_string())?;

	let pub_bytes = crypto::b64url_decode(pub_hdr).map_err(|e| e.to_string())?;
	if pub_bytes.len() != 32 {
		return Err("x-pub must be 32 bytes".to_string());
	}
	let sig_bytes = crypto::b64url_decode(sig_hdr).map_err(|e| e.to_string())?;
	if sig_bytes.len() != 64 {
		return Err("x-sig must be 64 bytes".to_string());
	}

	let now = now_secs();
	if (now - ts).abs() > TS_SKEW_SECS {
		return Err(format!("timestamp skew too large: now={now} ts={ts}"));
	}

	let mut pubkey = [0u8; 32];
	pubkey.copy_from_slice(&pub_bytes);
	let mut sig = [0u8; 64];
	sig.copy_from_slice(&sig_bytes);

	if !crypto::verify(&pubkey, msg, &sig) {
		return Err("signature verification failed".to_string());
	}

	Ok(VerifiedRequest {
		caller_pub: pubkey,
		caller_onion: crypto::onion_from_pub(&pubkey),
	})
}

struct ReplayEntry {
	key: (String, String, String),
	seen_at: i64,
}

/// TTL(300s)/cap(4096) replay-defense cache keyed by `(pub, canonical_path, body_hash)`.
/// Age-based eviction first, then an additional 25% drop of the oldest entries if still
/// over cap after eviction.
pub struct ReplayCache {
	entries: Vec<ReplayEntry>,
}

impl ReplayCache {
	pub fn new() -> Self {
		ReplayCache { entries: Vec::new() }
	}

	/// Returns `true` if this is the first time this `(pub, path, body)` has been seen
	/// within the TTL window (caller should proceed); `false` if it is a duplicate
	/// (caller should reply with the idempotent-success shortcut).
	pub fn seen_and_remember(&mut self, pub_b64: &str, canonical_path: &str, body: &[u8]) -> bool {
		let body_hash = crypto::sha256_hex(body);
		let key = (pub_b64.to_string(), canonical_path.to_string(), body_hash);
		let now = now_secs();

		self.evict_expired(now);

		if self.entries.iter().any(|e| e.key == key) {
			return false;
		}

		if self.entries.len() >= REPLAY_CAP {
			self.drop_oldest_fraction();
		}

		self.entries.push(ReplayEntry { key, seen_at: now });
		true
	}

	fn evict_expired(&mut self, now: i64) {
		self.entries.retain(|e| now - e.seen_at <= REPLAY_TTL_SECS);
	}

	fn drop_oldest_fraction(&mut self) {
		self.entries.sort_by_key(|e| e.seen_at);
		let drop_count = (self.entries.len() * 25) / 100;
		self.entries.drain(0..drop_count.max(1));
	}
}

impl Default for ReplayCache {
	fn default() -> Self {
		Self::new()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::identity::Identity;

	fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
		pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	#[test]
	fn canonical_path_orders_known_params_and_rejects_unknown() {
		let p = canonical_path(
			"/api/multisig/blob",
			&params(&[("ref", "T"), ("stage", "KEX"), ("i", "1")]),
		)
		.unwrap();
		assert_eq!(p, "/api/multisig/blob?ref=T&stage=KEX&i=1");

		let err = canonical_path("/api/ping", &params(&[("ref", "T"), ("bogus", "x")]));
		assert!(err.is_err());
	}

	#[test]
	fn sign_then_verify_get_round_trips() {
		let identity = Identity::generate("x").unwrap();
		let canon = "/api/ping?ref=T".to_string();
		let signed = sign_get(&identity, "T", &canon).unwrap();

		let mut headers = HashMap::new();
		for (k, v) in signed.to_vec() {
			headers.insert(k.to_string(), v);
		}
		let verified = verify_get(&headers, "T", &canon).unwrap();
		assert_eq!(verified.caller_pub, *identity.pubkey());
	}

	#[test]
	fn verify_get_rejects_stale_timestamp() {
		let identity = Identity::generate("x").unwrap();
		let canon = "/api/ping?ref=T".to_string();
		let ts = now_secs() - 1000;
		let msg = get_message_bytes("T", &canon, ts);
		let sig = identity.sign(&msg).unwrap();

		let mut headers = HashMap::new();
		headers.insert("x-pub".to_string(), crypto::b64url_encode(identity.pubkey()));
		headers.insert("x-ts".to_string(), ts.to_string());
		headers.insert("x-sig".to_string(), crypto::b64url_encode(&sig));

		assert!(verify_get(&headers, "T", &canon).is_err());
	}

	#[test]
	fn replay_cache_flags_duplicate_post_but_allows_distinct_bodies() {
		let mut cache = ReplayCache::new();
		assert!(cache.seen_and_remember("pub1", "/x?ref=T", b"body-a"));
		assert!(!cache.seen_and_remember("pub1", "/x?ref=T", b"body-a"));
		assert!(cache.seen_and_remember("pub1", "/x?ref=T", b"body-b"));
	}
}
