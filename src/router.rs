//! The inbound request handlers (§4.2, §4.5): `ping`, `blob`, `new`, and the
//! `transfer/*` family. Every handler re-validates method/path/query/auth/peer
//! membership before doing any work, in the order the design specifies.

use crate::account::AccountStore;
use crate::auth::{self, ReplayCache};
use crate::crypto;
use crate::error::WalletError;
use crate::identity::IdentityRegistry;
use crate::server::{InboundRequest, InboundResponse, RequestHandler};
use crate::session::SessionDirectory;
use crate::types::{NetType, TransferStage, TrustedPeer};
use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Mutex;

const ONLY_REF: &[&str] = &["ref"];
const ONLY_REF_STAGE_I: &[&str] = &["ref", "stage", "i"];
const ONLY_REF_TRANSFER_REF: &[&str] = &["ref", "transfer_ref"];

fn only_allowed_keys(query: &std::collections::HashMap<String, String>, allowed: &[&str]) -> bool {
	query.keys().all(|k| allowed.contains(&k.as_str()))
}

fn random_password(n: usize) -> String {
	const ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
	let mut rng = rand::thread_rng();
	(0..n).map(|_| ALPHABET[rng.gen_range(0, ALPHABET.len())] as char).collect()
}

/// Everything the router needs that isn't the account store itself: the set of
/// actively-running multisig sessions and their blob/peer state. Implemented by the
/// session registry so the router never reaches into a session's internals directly.
pub struct Router {
	pub bound_onion: Mutex<Option<String>>,
	pub account: std::sync::Arc<AccountStore>,
	pub identities: std::sync::Arc<Mutex<IdentityRegistry>>,
	pub sessions: std::sync::Arc<dyn SessionDirectory>,
	pub replay: Mutex<ReplayCache>,
}

impl Router {
	fn bound(&self) -> Option<String> {
		self.bound_onion.lock().unwrap().clone()
	}

	fn peers_include(&self, ref_: &str, bound: &str, onion: &str) -> bool {
		self.sessions
			.peers_for_ref(ref_, bound)
			.iter()
			.any(|p| p.eq_ignore_ascii_case(onion))
	}

	async fn handle_ping(&self, req: &InboundRequest) -> Option<InboundResponse> {
		if req.method != "GET" || req.path != "/api/ping" {
			return None;
		}
		let Some(bound) = self.bound() else {
			return Some(InboundResponse::plain(503, "Service warming up"));
		};
		if !only_allowed_keys(&req.query, ONLY_REF) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let Some(ref_) = req.query.get("ref") else {
			return Some(InboundResponse::plain(404, "Not found"));
		};

		let canon = match auth::canonical_path(&req.path, &req.query) {
			Ok(c) => c,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let verified = match auth::verify_get(&req.headers, ref_, &canon) {
			Ok(v) => v,
			Err(why) => {
				log::debug!("ping: signature error: {why}");
				return Some(InboundResponse::plain(404, "Not found"));
			}
		};
		if !self.peers_include(ref_, &bound, &verified.caller_onion) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		match self.sessions.meta(ref_, &bound) {
			Some(meta) => Some(InboundResponse::json(
				200,
				&json!({ "ref": ref_, "m": meta.m, "n": meta.n, "nettype": meta.nettype, "stage": meta.stage }),
			)),
			None => Some(InboundResponse::plain(404, "Not found")),
		}
	}

	async fn handle_blob(&self, req: &InboundRequest) -> Option<InboundResponse> {
		if req.method != "GET" || req.path != "/api/multisig/blob" {
			return None;
		}
		let Some(bound) = self.bound() else {
			return Some(InboundResponse::plain(503, "Service warming up"));
		};
		if !only_allowed_keys(&req.query, ONLY_REF_STAGE_I) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let (Some(ref_), Some(stage)) = (req.query.get("ref"), req.query.get("stage")) else {
			return Some(InboundResponse::plain(404, "Not found"));
		};
		let round: u32 = req.query.get("i").and_then(|v| v.parse().ok()).unwrap_or(0);

		let canon = match auth::canonical_path(&req.path, &req.query) {
			Ok(c) => c,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let verified = match auth::verify_get(&req.headers, ref_, &canon) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		if !self.peers_include(ref_, &bound, &verified.caller_onion) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		match self.sessions.blob(ref_, &bound, stage, round) {
			Some(blob) => {
				if stage == "PENDING" {
					self.sessions.register_pending_confirmation(ref_, &bound, &verified.caller_onion);
				}
				let blob_b64 = crypto::b64url_encode(&blob);
				let sha256 = crypto::sha256_hex(&blob);
				Some(InboundResponse::json(
					200,
					&json!({ "ref": ref_, "stage": stage, "i": round, "blob_b64": blob_b64, "sha256": sha256 }),
				))
			}
			None => Some(InboundResponse::plain(404, "Not found")),
		}
	}

	async fn handle_new(&self, req: &InboundRequest) -> Option<InboundResponse> {
		if req.method != "POST" || req.path != "/api/multisig/new" {
			return None;
		}
		if !only_allowed_keys(&req.query, ONLY_REF) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let Some(ref_) = req.query.get("ref").cloned() else {
			return Some(InboundResponse::plain(404, "Not found"));
		};

		let body: serde_json::Value = match serde_json::from_slice(&req.body) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};

		let my_net = self.account.with_document(|d| d.settings.network_type);
		let requested_net = body
			.get("net_type")
			.and_then(|v| v.as_str())
			.and_then(NetType::parse)
			.unwrap_or(NetType::Mainnet);
		if requested_net.as_str() != my_net.as_str() {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let canon = match auth::canonical_path(&req.path, &req.query) {
			Ok(c) => c,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let verified = match auth::verify_post(&req.headers, &ref_, &canon, &req.body) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};

		let pub_b64 = crypto::b64url_encode(&verified.caller_pub);
		{
			let mut replay = self.replay.lock().unwrap();
			if !replay.seen_and_remember(&pub_b64, &canon, &req.body) {
				return Some(InboundResponse::json(200, &json!({ "ok": true, "idempotent": true })));
			}
		}

		let sender_onion = verified.caller_onion.clone();
		let sender_is_ours = self.identities.lock().unwrap().owns(&sender_onion);

		let (m, n) = (
			body.get("m").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
			body.get("n").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
		);

		if !sender_is_ours {
			let policy_ok = self.account.with_document(|doc| {
				doc.trusted_peers.get(&sender_onion).map(|peer: &TrustedPeer| {
					peer.active
						&& m >= peer.min_threshold
						&& n <= peer.max_n
						&& (peer.max_number_wallets == 0 || peer.current_number_wallets < peer.max_number_wallets)
				})
			});
			if policy_ok != Some(true) {
				return Some(InboundResponse::plain(404, "Not found"));
			}
		}

		let body_peers: Vec<String> = body
			.get("peers")
			.and_then(|v| v.as_array())
			.map(|arr| arr.iter().filter_map(|v| v.as_str()).map(crypto::normalize_onion).collect())
			.unwrap_or_default();

		let owned: HashSet<String> = self.identities.lock().unwrap().onions().into_iter().collect();
		let matches: Vec<&String> = body_peers.iter().filter(|p| owned.contains(*p)).collect();
		if matches.len() != 1 {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let my_onion = matches[0].clone();

		let already_has_wallet = self
			.account
			.with_document(|doc| doc.monero.wallets.iter().any(|w| w.reference == ref_ && w.my_onion == my_onion));
		if already_has_wallet {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		if !sender_is_ours {
			let allowed = self.account.with_document(|doc| {
				doc.trusted_peers
					.get(&sender_onion)
					.map(|p| p.allowed_identities.contains(&my_onion))
					.unwrap_or(false)
			});
			if !allowed {
				return Some(InboundResponse::plain(404, "Not found"));
			}
		}

		let Some(bound) = self.bound() else {
			return Some(InboundResponse::plain(503, "Service warming up"));
		};
		if bound != my_onion {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		if self.sessions.running(&ref_, &bound) {
			return Some(InboundResponse::json(200, &json!({ "ok": true })));
		}

		if !sender_is_ours {
			let incremented = self.account.mutate(|doc| {
				match doc.trusted_peers.get_mut(&sender_onion) {
					Some(peer) => {
						peer.current_number_wallets += 1;
						Ok(())
					}
					None => Err(WalletError::policy_violated("trusted peer vanished")),
				}
			});
			if incremented.is_err() {
				return Some(InboundResponse::plain(404, "Not found"));
			}
		}

		let peers: Vec<String> = body_peers.into_iter().filter(|p| p != &my_onion).collect();
		let wallet_name = format!("wallet_for_ref_{ref_}");
		let wallet_password = random_password(20);

		match self
			.sessions
			.start(&ref_, &bound, m, n, peers, wallet_name, wallet_password, sender_onion)
		{
			Ok(()) => Some(InboundResponse::json(201, &json!({ "ok": true }))),
			Err(_) => Some(InboundResponse::plain(404, "Not found")),
		}
	}

	async fn handle_transfer_ping(&self, req: &InboundRequest) -> Option<InboundResponse> {
		if req.method != "GET" || req.path != "/api/multisig/transfer/ping" {
			return None;
		}
		if !only_allowed_keys(&req.query, ONLY_REF) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let Some(bound) = self.bound() else {
			return Some(InboundResponse::plain(503, "Service warming up"));
		};
		let Some(ref_) = req.query.get("ref") else {
			return Some(InboundResponse::plain(404, "Not found"));
		};
		if !self.peers_include(ref_, &bound, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		if !self.sessions.ref_exists(ref_, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let canon = match auth::canonical_path(&req.path, &req.query) {
			Ok(c) => c,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let verified = match auth::verify_get(&req.headers, ref_, &canon) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		if !self.peers_include(ref_, &bound, &verified.caller_onion) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let ready = self.sessions.wallet_ready(ref_, &bound);
		Some(InboundResponse::json(200, &json!({ "ref": ref_, "online": true, "ready": ready })))
	}

	async fn handle_transfer_request_info(&self, req: &InboundRequest) -> Option<InboundResponse> {
		if req.method != "GET" || req.path != "/api/multisig/transfer/request_info" {
			return None;
		}
		if !only_allowed_keys(&req.query, ONLY_REF) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let Some(ref_) = req.query.get("ref") else {
			return Some(InboundResponse::plain(404, "Not found"));
		};
		let Some(bound) = self.bound() else {
			return Some(InboundResponse::plain(404, "Not found"));
		};
		if !self.peers_include(ref_, &bound, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		if !self.sessions.ref_exists(ref_, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let canon = match auth::canonical_path(&req.path, &req.query) {
			Ok(c) => c,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let verified = match auth::verify_get(&req.headers, ref_, &canon) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		if !self.peers_include(ref_, &bound, &verified.caller_onion) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let (info, ts) = self.sessions.multisig_info(ref_, &bound).unwrap_or_default();
		let info_b64 = if info.is_empty() { None } else { Some(crypto::b64url_encode(&info)) };
		Some(InboundResponse::json(
			200,
			&json!({
				"ref": ref_,
				"time": ts,
				"multisig_info_b64": info_b64,
				"len": info.len(),
				"sha256": crypto::sha256_hex(&info),
			}),
		))
	}

	async fn handle_transfer_submit(&self, req: &InboundRequest) -> Option<InboundResponse> {
		if req.method != "POST" || req.path != "/api/multisig/transfer/submit" {
			return None;
		}
		if !only_allowed_keys(&req.query, ONLY_REF) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let Some(ref_) = req.query.get("ref").cloned() else {
			return Some(InboundResponse::plain(404, "Not found"));
		};
		let Some(bound) = self.bound() else {
			return Some(InboundResponse::plain(503, "Service warming up"));
		};
		if !self.peers_include(&ref_, &bound, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		if !self.sessions.ref_exists(&ref_, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let body: serde_json::Value = match serde_json::from_slice(&req.body) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let transfer_ref = body.get("transfer_ref").and_then(|v| v.as_str()).unwrap_or("");
		let transfer_blob = body.get("transfer_blob").and_then(|v| v.as_str()).unwrap_or("");
		let signing_order: Vec<String> = body
			.get("signing_order")
			.and_then(|v| v.as_array())
			.map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
			.unwrap_or_default();
		let who_has_signed: Vec<String> = body
			.get("who_has_signed")
			.and_then(|v| v.as_array())
			.map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
			.unwrap_or_default();

		if transfer_ref.is_empty() || transfer_blob.is_empty() || signing_order.is_empty() || body.get("who_has_signed").is_none() {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let canon = match auth::canonical_path(&req.path, &req.query) {
			Ok(c) => c,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let verified = match auth::verify_post(&req.headers, &ref_, &canon, &req.body) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		if !self.peers_include(&ref_, &bound, &verified.caller_onion) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let pub_b64 = crypto::b64url_encode(&verified.caller_pub);
		{
			let mut replay = self.replay.lock().unwrap();
			if !replay.seen_and_remember(&pub_b64, &canon, &req.body) {
				return Some(InboundResponse::json(
					200,
					&json!({ "success": true, "transfer_ref": transfer_ref, "idempotent": true, "message": "Duplicate submit ignored" }),
				));
			}
		}

		match self
			.sessions
			.save_incoming_transfer(&ref_, &bound, transfer_ref, body.clone(), signing_order, who_has_signed)
		{
			Ok(()) => {
				if let Err(e) = self.sessions.process_incoming_transfer(&ref_, &bound, transfer_ref).await {
					log::warn!("transfer {transfer_ref} failed validate/sign/forward: {e}");
				}
				Some(InboundResponse::json(
					200,
					&json!({ "success": true, "transfer_ref": transfer_ref, "message": "Transfer received" }),
				))
			}
			Err(_) => Some(InboundResponse::plain(404, "Not found")),
		}
	}

	async fn handle_transfer_status(&self, req: &InboundRequest) -> Option<InboundResponse> {
		if req.method != "GET" || req.path != "/api/multisig/transfer/status" {
			return None;
		}
		if !only_allowed_keys(&req.query, ONLY_REF_TRANSFER_REF) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let Some(bound) = self.bound() else {
			return Some(InboundResponse::plain(503, "Service warming up"));
		};
		let Some(ref_) = req.query.get("ref") else {
			return Some(InboundResponse::plain(404, "Not found"));
		};
		if !self.peers_include(ref_, &bound, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}
		let Some(transfer_ref) = req.query.get("transfer_ref") else {
			return Some(InboundResponse::plain(404, "Not found"));
		};
		if !self.sessions.ref_exists(ref_, &bound) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		let canon = match auth::canonical_path(&req.path, &req.query) {
			Ok(c) => c,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		let verified = match auth::verify_get(&req.headers, ref_, &canon) {
			Ok(v) => v,
			Err(_) => return Some(InboundResponse::plain(404, "Not found")),
		};
		if !self.peers_include(ref_, &bound, &verified.caller_onion) {
			return Some(InboundResponse::plain(404, "Not found"));
		}

		match self.sessions.saved_transfer(ref_, &bound, transfer_ref) {
			Some((stage, status, tx_id)) => {
				let signed_stages = [
					TransferStage::CheckingStatus,
					TransferStage::Broadcasting,
					TransferStage::Complete,
				];
				let has_signed = signed_stages.contains(&stage);
				Some(InboundResponse::json(
					200,
					&json!({
						"ref": ref_,
						"transferRef": transfer_ref,
						"online": true,
						"time": auth::now_secs(),
						"received_transfer": true,
						"has_signed": has_signed,
						"stage_name": format!("{:?}", stage).to_uppercase(),
						"status": status,
						"tx_id": if tx_id.is_empty() { "pending".to_string() } else { tx_id },
					}),
				))
			}
			None => Some(InboundResponse::plain(404, "Not found")),
		}
	}
}

#[async_trait]
impl RequestHandler for Router {
	async fn handle(&self, request: InboundRequest) -> InboundResponse {
		if let Some(r) = self.handle_transfer_ping(&request).await {
			return r;
		}
		if let Some(r) = self.handle_transfer_request_info(&request).await {
			return r;
		}
		if let Some(r) = self.handle_transfer_submit(&request).await {
			return r;
		}
		if let Some(r) = self.handle_transfer_status(&request).await {
			return r;
		}
		if let Some(r) = self.handle_ping(&request).await {
			return r;
		}
		if let Some(r) = self.handle_blob(&request).await {
			return r;
		}
		if let Some(r) = self.handle_new(&request).await {
			return r;
		}
		InboundResponse::plain(404, "Not found")
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::session::mock::MockSessionDirectory;
	use std::collections::HashMap;

	fn router_with(bound: Option<&str>) -> Router {
		let dir = tempfile::tempdir().unwrap();
		let account = std::sync::Arc::new(AccountStore::create(&dir.path().join("a.dat"), "pw").unwrap());
		Router {
			bound_onion: Mutex::new(bound.map(String::from)),
			account,
			identities: std::sync::Arc::new(Mutex::new(IdentityRegistry::new())),
			sessions: std::sync::Arc::new(MockSessionDirectory::default()),
			replay: Mutex::new(ReplayCache::new()),
		}
	}

	#[tokio::test]
	async fn ping_returns_503_when_not_yet_bound() {
		let router = router_with(None);
		let req = InboundRequest {
			method: "GET".into(),
			path: "/api/ping".into(),
			query: HashMap::from([("ref".to_string(), "T".to_string())]),
			headers: HashMap::new(),
			body: Vec::new(),
		};
		let resp = router.handle(req).await;
		assert_eq!(resp.status, 503);
	}

	#[tokio::test]
	async fn unknown_path_falls_through_to_404() {
		let router = router_with(Some("bound.onion"));
		let req = InboundRequest {
			method: "GET".into(),
			path: "/nonexistent".into(),
			query: HashMap::new(),
			headers: HashMap::new(),
			body: Vec::new(),
		};
		let resp = router.handle(req).await;
		assert_eq!(resp.status, 404);
	}

	#[tokio::test]
	async fn ping_rejects_unknown_query_keys() {
		let router = router_with(Some("bound.onion"));
		let req = InboundRequest {
			method: "GET".into(),
			path: "/api/ping".into(),
			query: HashMap::from([("ref".to_string(), "T".to_string()), ("evil".to_string(), "1".to_string())]),
			headers: HashMap::new(),
			body: Vec::new(),
		};
		let resp = router.handle(req).await;
		assert_eq!(resp.status, 404);
	}
}
