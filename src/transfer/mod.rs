//! Outbound side of a multisig spend proposal (§4.6): walk the full
//! `CHECKING_PEERS -> COLLECTING_INFO -> CREATING_TRANSFER -> VALIDATING -> APPROVING ->
//! SUBMITTING -> CHECKING_STATUS` sequence, then track every peer's reported stage until
//! the transfer reaches a terminal one.
//!
//! The inbound side (receiving someone else's proposal, answering status queries) is
//! handled by [`crate::session::SessionDirectory`] and the router directly; there is no
//! separate incoming-transfer type because accepting a proposal is just a router-level
//! mutation of the same session state the creation handshake already maintains.

use crate::account::AccountStore;
use crate::error::{Result, WalletError};
use crate::identity::{Identity, IdentityRegistry};
use crate::notifier;
use crate::transport::TorTransport;
use crate::types::{PeerTransferStatus, TransferDescription, TransferRecord, TransferStage, TransferType};
use crate::wallet::WalletAdapterHandle;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

/// How often an un-ready peer is re-polled during `CHECKING_PEERS`/`COLLECTING_INFO`.
const PEER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const PEER_POLL_MAX_ATTEMPTS: u32 = 3600;

/// A peer's multisig info is reusable for this long before it must be re-fetched.
const INFO_FRESHNESS_SECS: i64 = 300;

/// `APPROVING` is forced when the fee exceeds this fraction of the sum of destination
/// amounts and the account's `inspect_guard` setting is on.
const FEE_RATIO_INSPECT_THRESHOLD: f64 = 0.005;

/// Status-tracker poll cadence (§4.8's default backoff).
const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(2000);

pub struct TransferInitiator<W, T> {
	wallet: Arc<W>,
	transport: Arc<T>,
	identities: Arc<Mutex<IdentityRegistry>>,
	account: Arc<AccountStore>,
	self_ref: Mutex<Weak<TransferInitiator<W, T>>>,
}

pub struct InitiatedTransfer {
	pub transfer_ref: String,
	pub description: TransferDescription,
	/// `true` when `APPROVING` stopped short of `SUBMITTING`: the transfer is built,
	/// signed by us, and persisted, but waiting on [`TransferInitiator::approve_and_submit`].
	pub needs_approval: bool,
}

/// One peer's reported view of a transfer, as returned by `/transfer/status`.
pub struct PeerStatusReport {
	pub stage: TransferStage,
	pub received: bool,
	pub signed: bool,
	pub status: String,
	pub tx_id: String,
}

impl<W, T> TransferInitiator<W, T>
where
	W: WalletAdapterHandle + 'static,
	T: TorTransport + 'static,
{
	pub fn new(wallet: Arc<W>, transport: Arc<T>, identities: Arc<Mutex<IdentityRegistry>>, account: Arc<AccountStore>) -> Arc<Self> {
		let initiator = Arc::new(TransferInitiator {
			wallet,
			transport,
			identities,
			account,
			self_ref: Mutex::new(Weak::new()),
		});
		*initiator.self_ref.lock().expect("self_ref mutex poisoned") = Arc::downgrade(&initiator);
		initiator
	}

	/// Recovers an owning handle so the status tracker (spawned from a `&self` method)
	/// can hold something across awaits. See [`crate::session::SessionRegistry::self_arc`]
	/// for the identical pattern this one is copied from.
	fn self_arc(&self) -> Arc<Self> {
		self.self_ref
			.lock()
			.expect("self_ref mutex poisoned")
			.upgrade()
			.expect("TransferInitiator must be constructed via TransferInitiator::new")
	}

	fn identity_for(&self, bound_onion: &str) -> Result<Identity> {
		self.identities
			.lock()
			.expect("identity registry poisoned")
			.get(bound_onion)
			.cloned()
			.ok_or_else(|| WalletError::not_found("bound identity vanished"))
	}

	/// Runs `CHECKING_PEERS` through `VALIDATING`/`APPROVING`, then either submits
	/// immediately (when no inspection is required) or stops and returns
	/// `needs_approval: true` for the caller to confirm via [`Self::approve_and_submit`].
	pub async fn initiate(
		&self,
		reference: &str,
		bound_onion: &str,
		destinations: Vec<(String, u64)>,
		fee_priority: u32,
		user_requested_inspect: bool,
	) -> Result<InitiatedTransfer> {
		let (wallet_name, peers, _threshold) = self.wallet_lookup(reference, bound_onion)?;
		let identity = self.identity_for(bound_onion)?;

		self.wait_for_peers_ready(&identity, reference, &peers).await?;
		let peer_infos = self.collect_fresh_peer_info(&identity, reference, &peers).await?;

		self.wallet.import_multisig_bulk(wallet_name.clone(), peer_infos).await?;
		let unsigned = self
			.wallet
			.create_unsigned_multisig_transfer(wallet_name.clone(), destinations.clone(), fee_priority)
			.await?;
		let description = self.wallet.describe_transfer(wallet_name.clone(), unsigned.clone()).await?;

		let sum: u64 = destinations.iter().map(|(_, amount)| *amount).sum();
		let fee_ratio_high = sum > 0 && (description.fee as f64 / sum as f64) > FEE_RATIO_INSPECT_THRESHOLD;
		let inspect_guard_on = self.account.with_document(|doc| doc.settings.inspect_guard);
		let needs_approval = user_requested_inspect || (fee_ratio_high && inspect_guard_on);

		let (partially_signed, _ready, _tx_ids) = self.wallet.sign_multisig(wallet_name.clone(), unsigned).await?;

		let mut signing_order = peers.clone();
		signing_order.push(bound_onion.to_string());
		signing_order.sort_by_key(|s| s.to_ascii_lowercase());
		signing_order.dedup_by(|a, b| a.eq_ignore_ascii_case(b));

		let transfer_ref = format!("{reference}-transfer-{}", crate::auth::now_secs());

		self.account.mutate(|doc| {
			let wallet = doc
				.monero
				.wallets
				.iter_mut()
				.find(|w| w.reference == reference && w.my_onion == bound_onion)
				.ok_or_else(|| WalletError::not_found("no such wallet"))?;
			wallet.transfers.insert(
				transfer_ref.clone(),
				TransferRecord {
					kind: TransferType::Multisig,
					wallet_name: wallet_name.clone(),
					wallet_ref: reference.to_string(),
					destinations: destinations.clone(),
					peers: HashMap::new(),
					signing_order: signing_order.clone(),
					stage: TransferStage::Validating,
					status: if needs_approval {
						"awaiting your approval before sending to peer".to_string()
					} else {
						"awaiting co-signatures".to_string()
					},
					signatures: vec![bound_onion.to_string()],
					transfer_blob: partially_signed.clone(),
					transfer_description: description.clone(),
					tx_id: String::new(),
					created_at: crate::auth::now_secs(),
					received_at: None,
					submitted_at: None,
					declined_at: None,
					my_onion: bound_onion.to_string(),
				},
			);
			Ok(())
		})?;

		if needs_approval {
			return Ok(InitiatedTransfer {
				transfer_ref,
				description,
				needs_approval: true,
			});
		}

		self.submit_to_next_signer(reference, bound_onion, &transfer_ref).await?;
		Ok(InitiatedTransfer {
			transfer_ref,
			description,
			needs_approval: false,
		})
	}

	/// Proceeds past `APPROVING` for a transfer [`Self::initiate`] left waiting on the
	/// user (`needs_approval: true`): forwards to the first not-yet-signed peer in
	/// `signing_order` and starts the status tracker.
	pub async fn approve_and_submit(&self, reference: &str, bound_onion: &str, transfer_ref: &str) -> Result<()> {
		self.submit_to_next_signer(reference, bound_onion, transfer_ref).await
	}

	/// `CHECKING_PEERS`: polls every peer's `/transfer/ping` until all report
	/// `online && ready`.
	async fn wait_for_peers_ready(&self, identity: &Identity, reference: &str, peers: &[String]) -> Result<()> {
		for _ in 0..PEER_POLL_MAX_ATTEMPTS {
			let mut all_ready = true;
			for peer in peers {
				let ready = match self.transport.get_signed(identity, peer, "/api/multisig/transfer/ping", reference).await {
					Ok(resp) if resp.status == 200 => resp
						.json()
						.ok()
						.map(|json| {
							json.get("online").and_then(|v| v.as_bool()).unwrap_or(false)
								&& json.get("ready").and_then(|v| v.as_bool()).unwrap_or(false)
						})
						.unwrap_or(false),
					_ => false,
				};
				if !ready {
					all_ready = false;
				}
			}
			if all_ready {
				return Ok(());
			}
			tokio::time::sleep(PEER_POLL_INTERVAL).await;
		}
		Err(WalletError::Transport("peers never became ready for transfer".into()))
	}

	/// `COLLECTING_INFO`: polls every peer's `/transfer/request_info`, validating
	/// `len`/`sha256` against the decoded blob, until every peer's cached info is no
	/// older than [`INFO_FRESHNESS_SECS`].
	async fn collect_fresh_peer_info(&self, identity: &Identity, reference: &str, peers: &[String]) -> Result<Vec<String>> {
		let mut cache: HashMap<String, (String, i64)> = HashMap::new();
		for _ in 0..PEER_POLL_MAX_ATTEMPTS {
			for peer in peers {
				let fresh = cache
					.get(peer)
					.map(|(_, ts)| crate::auth::now_secs() - ts <= INFO_FRESHNESS_SECS)
					.unwrap_or(false);
				if fresh {
					continue;
				}
				let Ok(resp) = self.transport.get_signed(identity, peer, "/api/multisig/transfer/request_info", reference).await else {
					continue;
				};
				if resp.status != 200 {
					continue;
				}
				let Ok(json) = resp.json() else { continue };
				let Some(info_b64) = json.get("multisig_info_b64").and_then(|v| v.as_str()) else {
					continue;
				};
				let Ok(bytes) = crate::crypto::b64url_decode(info_b64) else { continue };
				let len_ok = json.get("len").and_then(|v| v.as_u64()).map(|l| l as usize == bytes.len()).unwrap_or(true);
				let sha_ok = json
					.get("sha256")
					.and_then(|v| v.as_str())
					.map(|s| s == crate::crypto::sha256_hex(&bytes))
					.unwrap_or(true);
				if !len_ok || !sha_ok {
					continue;
				}
				let Ok(text) = String::from_utf8(bytes) else { continue };
				let ts = json.get("time").and_then(|v| v.as_i64()).unwrap_or_else(crate::auth::now_secs);
				cache.insert(peer.clone(), (text, ts));
			}

			let all_fresh = peers
				.iter()
				.all(|p| cache.get(p).map(|(_, ts)| crate::auth::now_secs() - ts <= INFO_FRESHNESS_SECS).unwrap_or(false));
			if all_fresh {
				return Ok(peers.iter().filter_map(|p| cache.get(p).map(|(info, _)| info.clone())).collect());
			}
			tokio::time::sleep(PEER_POLL_INTERVAL).await;
		}
		Err(WalletError::Transport("peers never produced fresh multisig info".into()))
	}

	/// `SUBMITTING`: forwards to the first entry in `signing_order` not yet present in
	/// `signatures`. If everyone has already signed, there is no one left to forward to
	/// and the transfer goes straight to `CHECKING_STATUS` (mirrors
	/// `submitToNextPeer()`'s empty-`nextPeer` case).
	async fn submit_to_next_signer(&self, reference: &str, bound_onion: &str, transfer_ref: &str) -> Result<()> {
		let entry = self.account.with_document(|doc| {
			doc.monero
				.wallets
				.iter()
				.find(|w| w.reference == reference && w.my_onion == bound_onion)
				.and_then(|w| w.transfers.get(transfer_ref))
				.map(|t| (t.signing_order.clone(), t.signatures.clone(), t.transfer_blob.clone(), t.transfer_description.clone(), t.created_at))
		});
		let Some((signing_order, signatures, transfer_blob, transfer_description, created_at)) = entry else {
			return Err(WalletError::not_found("no such transfer"));
		};

		let next_peer = signing_order.iter().find(|o| !signatures.iter().any(|s| s.eq_ignore_ascii_case(o))).cloned();

		let Some(next_peer) = next_peer else {
			self.mark_checking_status(reference, bound_onion, transfer_ref, "all signers accounted for; awaiting broadcast")?;
			self.spawn_tracker(reference.to_string(), bound_onion.to_string(), transfer_ref.to_string());
			return Ok(());
		};

		let identity = self.identity_for(bound_onion)?;
		let body = serde_json::to_vec(&serde_json::json!({
			"transfer_ref": transfer_ref,
			"transfer_blob": transfer_blob,
			"signing_order": signing_order,
			"who_has_signed": signatures,
			"transfer_description": transfer_description,
			"created_at": created_at,
		}))?;

		notifier::post_with_retry(
			self.transport.as_ref(),
			&identity,
			&next_peer,
			"/api/multisig/transfer/submit",
			reference,
			&body,
		)
		.await?;

		self.mark_checking_status(reference, bound_onion, transfer_ref, "awaiting peer status")?;
		self.spawn_tracker(reference.to_string(), bound_onion.to_string(), transfer_ref.to_string());
		Ok(())
	}

	fn mark_checking_status(&self, reference: &str, bound_onion: &str, transfer_ref: &str, status: &str) -> Result<()> {
		self.account.mutate(|doc| {
			let wallet = doc
				.monero
				.wallets
				.iter_mut()
				.find(|w| w.reference == reference && w.my_onion == bound_onion)
				.ok_or_else(|| WalletError::not_found("no such wallet"))?;
			let transfer = wallet
				.transfers
				.get_mut(transfer_ref)
				.ok_or_else(|| WalletError::not_found("no such transfer"))?;
			transfer.stage = TransferStage::CheckingStatus;
			transfer.submitted_at = Some(crate::auth::now_secs());
			transfer.status = status.to_string();
			Ok(())
		})
	}

	fn spawn_tracker(&self, reference: String, bound_onion: String, transfer_ref: String) {
		let initiator = self.self_arc();
		tokio::spawn(async move {
			initiator.track_status(reference, bound_onion, transfer_ref).await;
		});
	}

	/// Status tracker (§4.8): polls every other entry in `signing_order` on
	/// [`STATUS_POLL_INTERVAL`], folds their reported stage into an aggregate by
	/// `TransferStage::rank()`, and persists both the per-peer record and the aggregate.
	/// Stops once the aggregate reaches a terminal stage.
	async fn track_status(&self, reference: String, bound_onion: String, transfer_ref: String) {
		loop {
			let signing_order = self
				.account
				.with_document(|doc| {
					doc.monero
						.wallets
						.iter()
						.find(|w| w.reference == reference && w.my_onion == bound_onion)
						.and_then(|w| w.transfers.get(&transfer_ref))
						.map(|t| t.signing_order.clone())
				})
				.unwrap_or_default();
			let peers: Vec<&String> = signing_order.iter().filter(|o| !o.eq_ignore_ascii_case(&bound_onion)).collect();

			let mut reports: HashMap<String, PeerStatusReport> = HashMap::new();
			for peer in &peers {
				if let Ok(report) = self.poll_status(&reference, &bound_onion, peer, &transfer_ref).await {
					reports.insert((*peer).clone(), report);
				}
			}

			let best = reports.values().max_by_key(|r| r.stage.rank());
			let aggregate_stage = best.map(|r| r.stage);
			let aggregate_tx_id = best.filter(|r| !r.tx_id.is_empty() && r.tx_id != "pending").map(|r| r.tx_id.clone());

			if let Some(stage) = aggregate_stage {
				let _ = self.account.mutate(|doc| {
					let wallet = doc
						.monero
						.wallets
						.iter_mut()
						.find(|w| w.reference == reference && w.my_onion == bound_onion)
						.ok_or_else(|| WalletError::not_found("no such wallet"))?;
					let transfer = wallet
						.transfers
						.get_mut(&transfer_ref)
						.ok_or_else(|| WalletError::not_found("no such transfer"))?;
					for (peer, report) in &reports {
						transfer.peers.insert(
							peer.clone(),
							PeerTransferStatus {
								stage: format!("{:?}", report.stage).to_uppercase(),
								received: report.received,
								signed: report.signed,
								status: report.status.clone(),
							},
						);
					}
					transfer.stage = stage;
					if let Some(tx_id) = &aggregate_tx_id {
						transfer.tx_id = tx_id.clone();
					}
					transfer.status = format!("{stage:?}");
					Ok(())
				});

				if stage.is_terminal() {
					return;
				}
			}

			tokio::time::sleep(STATUS_POLL_INTERVAL).await;
		}
	}

	/// Queries one peer's view of `transfer_ref`.
	pub async fn poll_status(&self, reference: &str, bound_onion: &str, peer: &str, transfer_ref: &str) -> Result<PeerStatusReport> {
		let identity = self.identity_for(bound_onion)?;
		let resp = self.transport.get_transfer_status(&identity, peer, reference, transfer_ref).await?;
		let json = resp.json()?;
		let stage_name = json.get("stage_name").and_then(|v| v.as_str()).unwrap_or("ERROR");
		Ok(PeerStatusReport {
			stage: parse_stage(stage_name),
			received: json.get("received_transfer").and_then(|v| v.as_bool()).unwrap_or(false),
			signed: json.get("has_signed").and_then(|v| v.as_bool()).unwrap_or(false),
			status: json.get("status").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
			tx_id: json.get("tx_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
		})
	}

	fn wallet_lookup(&self, reference: &str, bound_onion: &str) -> Result<(String, Vec<String>, u32)> {
		self.account.with_document(|doc| {
			doc.monero
				.wallets
				.iter()
				.find(|w| w.reference == reference && w.my_onion == bound_onion)
				.map(|w| (w.name.clone(), w.peers.clone(), w.threshold))
				.ok_or_else(|| WalletError::not_found("no such wallet"))
		})
	}
}

fn parse_stage(name: &str) -> TransferStage {
	match name {
		"RECEIVED" => TransferStage::Received,
		"VALIDATING" => TransferStage::Validating,
		"SIGNING" => TransferStage::Signing,
		"SUBMITTING" => TransferStage::Submitting,
		"CHECKING_STATUS" => TransferStage::CheckingStatus,
		"BROADCASTING" => TransferStage::Broadcasting,
		"COMPLETE" => TransferStage::Complete,
		"DECLINED" => TransferStage::Declined,
		_ => TransferStage::Error,
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::mock::MockTransport;
	use crate::transport::SignedResponse;
	use crate::wallet::mock::MockWalletLibrary;
	use crate::wallet::WalletAdapter;
	use tempfile::tempdir;

	fn setup() -> (Arc<TransferInitiator<WalletAdapter, MockTransport>>, String) {
		let dir = tempdir().unwrap();
		let account = Arc::new(AccountStore::create(&dir.path().join("a.dat"), "pw").unwrap());
		let identity = crate::identity::Identity::generate("main").unwrap();
		let bound_onion = identity.onion_address.clone();
		let mut registry = IdentityRegistry::new();
		registry.insert(identity);

		account
			.mutate(|doc| {
				doc.monero.wallets.push(crate::types::WalletRecord {
					name: "w1".to_string(),
					password: "pw".to_string(),
					seed: String::new(),
					address: "addr".to_string(),
					restore_height: 0,
					my_onion: bound_onion.clone(),
					reference: "T".to_string(),
					multisig: true,
					threshold: 2,
					total: 3,
					peers: vec!["peera.onion".to_string(), "peerb.onion".to_string()],
					online: true,
					creator: true,
					archived: false,
					net_type: crate::types::NetType::Mainnet,
					transfers: HashMap::new(),
				});
				Ok(())
			})
			.unwrap();

		let wallet = Arc::new(WalletAdapter::new(Box::new(MockWalletLibrary::default())));
		let transport = Arc::new(MockTransport::default());
		for peer in ["peera.onion", "peerb.onion"] {
			transport.set_response(
				peer,
				"/api/multisig/transfer/ping",
				SignedResponse {
					status: 200,
					body: br#"{"ref":"T","online":true,"ready":true}"#.to_vec(),
				},
			);
			transport.set_response(
				peer,
				"/api/multisig/transfer/request_info",
				SignedResponse {
					status: 200,
					body: br#"{"ref":"T","time":9999999999,"multisig_info_b64":"a2V4LWluZm8","len":8,"sha256":"916a7b930ee8ecbb4995f9cf75df1684ba3502fcf8ed0ac77dd35818fa228689"}"#.to_vec(),
				},
			);
		}
		transport.set_response(
			"peera.onion",
			"/api/multisig/transfer/submit",
			SignedResponse {
				status: 200,
				body: br#"{"success":true}"#.to_vec(),
			},
		);

		(
			TransferInitiator::new(wallet, transport, Arc::new(Mutex::new(registry)), account),
			bound_onion,
		)
	}

	#[tokio::test]
	async fn initiate_forwards_only_to_the_first_unsigned_signer() {
		let (initiator, bound_onion) = setup();
		let result = initiator
			.initiate("T", &bound_onion, vec![("44xmraddr".to_string(), 1_000_000)], 1, false)
			.await
			.unwrap();
		assert!(result.transfer_ref.starts_with("T-transfer-"));
		assert!(!result.needs_approval);

		initiator.account.with_document(|doc| {
			let wallet = doc.monero.wallets.iter().find(|w| w.reference == "T").unwrap();
			let transfer = wallet.transfers.get(&result.transfer_ref).unwrap();
			assert_eq!(transfer.stage, TransferStage::CheckingStatus);
			assert!(transfer.submitted_at.is_some());
		});

		let calls = initiator.transport.calls.lock().unwrap();
		let submit_calls = calls.iter().filter(|(_, path)| path == "/api/multisig/transfer/submit").count();
		assert_eq!(submit_calls, 1, "only the first unsigned peer should receive the submit POST");
	}

	#[tokio::test]
	async fn needs_approval_stops_before_submitting() {
		let (initiator, bound_onion) = setup();
		let result = initiator
			.initiate("T", &bound_onion, vec![("44xmraddr".to_string(), 1_000_000)], 1, true)
			.await
			.unwrap();
		assert!(result.needs_approval);

		let calls = initiator.transport.calls.lock().unwrap();
		assert!(!calls.iter().any(|(_, path)| path == "/api/multisig/transfer/submit"));
	}
}
