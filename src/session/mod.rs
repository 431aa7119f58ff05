//! The multisig creation session state machine (§4.5-§4.6):
//! `INIT -> WAIT_PEERS -> KEX(rounds) -> ACK -> PENDING -> COMPLETE/ERROR`.
//!
//! A session is driven entirely by a background task spawned from [`SessionRegistry::start`];
//! the router only ever reads state back out through the [`SessionDirectory`] trait, so it
//! never touches a session's internals directly.

use crate::account::AccountStore;
use crate::chain_height;
use crate::error::{Result, WalletError};
use crate::event::{Event, EventSink};
use crate::identity::{Identity, IdentityRegistry};
use crate::ids::SessionId;
use crate::transport::TorTransport;
use crate::types::{TransferStage, WalletRecord};
use crate::wallet::WalletAdapterHandle;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

const PEER_POLL_INTERVAL: Duration = Duration::from_secs(5);
const PEER_POLL_MAX_ATTEMPTS: u32 = 3600;
const PENDING_CONFIRM_MAX_ATTEMPTS: u32 = 3600;

#[derive(Clone, Debug, PartialEq)]
pub enum Stage {
	Init,
	WaitPeers,
	Kex { round: u32 },
	Ack,
	Pending,
	Complete,
	Error,
}

impl Stage {
	fn name(&self) -> &'static str {
		match self {
			Stage::Init => "INIT",
			Stage::WaitPeers => "WAIT_PEERS",
			Stage::Kex { .. } => "KEX",
			Stage::Ack => "ACK",
			Stage::Pending => "PENDING",
			Stage::Complete => "COMPLETE",
			Stage::Error => "ERROR",
		}
	}
}

pub struct SessionMeta {
	pub m: u32,
	pub n: u32,
	pub nettype: String,
	pub stage: String,
}

struct TransferEntry {
	stage: TransferStage,
	status: String,
	tx_id: String,
	transfer_blob: String,
	signing_order: Vec<String>,
	who_has_signed: Vec<String>,
	transfer_description: serde_json::Value,
	created_at: i64,
}

struct SessionState {
	id: SessionId,
	m: u32,
	n: u32,
	peers: Vec<String>,
	wallet_name: String,
	wallet_password: String,
	creator_onion: String,
	stage: Stage,
	blobs: HashMap<(String, u32), Vec<u8>>,
	pending_confirmations: HashSet<String>,
	multisig_info: Option<(Vec<u8>, i64)>,
	transfers: HashMap<String, TransferEntry>,
}

/// Everything the router needs from session/transfer state, without coupling it to a
/// concrete wallet library, transport, or account store.
#[async_trait]
pub trait SessionDirectory: Send + Sync {
	fn meta(&self, reference: &str, bound_onion: &str) -> Option<SessionMeta>;
	fn blob(&self, reference: &str, bound_onion: &str, stage: &str, round: u32) -> Option<Vec<u8>>;
	fn peers_for_ref(&self, reference: &str, bound_onion: &str) -> Vec<String>;
	fn register_pending_confirmation(&self, reference: &str, bound_onion: &str, peer_onion: &str);
	fn ref_exists(&self, reference: &str, bound_onion: &str) -> bool;
	fn running(&self, reference: &str, bound_onion: &str) -> bool;
	#[allow(clippy::too_many_arguments)]
	fn start(
		&self,
		reference: &str,
		bound_onion: &str,
		m: u32,
		n: u32,
		peers: Vec<String>,
		wallet_name: String,
		wallet_password: String,
		creator_onion: String,
	) -> Result<()>;
	fn wallet_ready(&self, reference: &str, bound_onion: &str) -> bool;
	fn multisig_info(&self, reference: &str, bound_onion: &str) -> Option<(Vec<u8>, i64)>;
	fn save_incoming_transfer(
		&self,
		reference: &str,
		bound_onion: &str,
		transfer_ref: &str,
		payload: serde_json::Value,
		signing_order: Vec<String>,
		who_has_signed: Vec<String>,
	) -> Result<()>;
	fn saved_transfer(&self, reference: &str, bound_onion: &str, transfer_ref: &str) -> Option<(TransferStage, String, String)>;
	/// Incoming transfer handler (§4.7): validates, signs with our key share, then either
	/// broadcasts (if we were the last required signature) or forwards to the next
	/// not-yet-signed peer in `signing_order`.
	async fn process_incoming_transfer(&self, reference: &str, bound_onion: &str, transfer_ref: &str) -> Result<()>;
}

/// Owns every running session for every bound identity and drives each one's KEX
/// rounds on a spawned task. `ref` and `bound_onion` together key a session because
/// the same human-chosen `ref` can legitimately be reused across unrelated onions.
pub struct SessionRegistry<W, T> {
	wallet: Arc<W>,
	transport: Arc<T>,
	account: Arc<AccountStore>,
	identities: Arc<Mutex<IdentityRegistry>>,
	events: Arc<dyn EventSink>,
	sessions: Mutex<HashMap<(String, String), SessionState>>,
	self_ref: Mutex<Weak<SessionRegistry<W, T>>>,
	socks5_addr: String,
}

impl<W, T> SessionRegistry<W, T>
where
	W: WalletAdapterHandle + 'static,
	T: TorTransport + 'static,
{
	pub fn new(
		wallet: Arc<W>,
		transport: Arc<T>,
		account: Arc<AccountStore>,
		identities: Arc<Mutex<IdentityRegistry>>,
		events: Arc<dyn EventSink>,
		socks5_addr: String,
	) -> Arc<Self> {
		let registry = Arc::new(SessionRegistry {
			wallet,
			transport,
			account,
			identities,
			events,
			sessions: Mutex::new(HashMap::new()),
			self_ref: Mutex::new(Weak::new()),
			socks5_addr,
		});
		*registry.self_ref.lock().expect("self_ref mutex poisoned") = Arc::downgrade(&registry);
		registry
	}

	fn key(reference: &str, bound_onion: &str) -> (String, String) {
		(reference.to_string(), bound_onion.to_string())
	}

	fn set_stage(&self, key: &(String, String), stage: Stage) {
		let mut sessions = self.sessions.lock().expect("session map poisoned");
		if let Some(state) = sessions.get_mut(key) {
			state.stage = stage.clone();
			self.events.emit(Event::SessionStageChanged {
				session: state.id,
				stage: stage.name().to_string(),
			});
		}
	}

	async fn run(self: Arc<Self>, key: (String, String)) {
		if let Err(e) = self.run_inner(&key).await {
			log::warn!("session {:?} failed: {e}", key);
			self.set_stage(&key, Stage::Error);
		}
	}

	async fn run_inner(&self, key: &(String, String)) -> Result<()> {
		let (wallet_name, wallet_password, m, n, peers, bound_onion) = {
			let sessions = self.sessions.lock().expect("session map poisoned");
			let state = sessions.get(key).ok_or_else(|| WalletError::not_found("session vanished"))?;
			(
				state.wallet_name.clone(),
				state.wallet_password.clone(),
				state.m,
				state.n,
				state.peers.clone(),
				key.1.clone(),
			)
		};

		self.set_stage(key, Stage::WaitPeers);
		let peer_onions: Vec<String> = peers.into_iter().filter(|p| p != &bound_onion).collect();

		let identity = self
			.identities
			.lock()
			.expect("identity registry poisoned")
			.get(&bound_onion)
			.cloned_for_session()?;

		self.wait_for_peers_online(&identity, &key.0, &peer_onions, m, n).await?;

		let own_info = self.wallet.first_kex_msg(wallet_name.clone(), m, peer_onions.clone()).await?;
		self.store_blob(key, "KEX", 0, own_info.into_bytes());
		self.set_stage(key, Stage::Kex { round: 0 });

		let peer_infos = self
			.collect_peer_blobs(&identity, &key.0, &peer_onions, "KEX", 0)
			.await?;

		let mut latest = self
			.wallet
			.make_multisig(wallet_name.clone(), peer_infos, m, wallet_password.clone())
			.await?;

		let mut round = 1u32;
		loop {
			if self.wallet.is_multisig_ready(wallet_name.clone()).await? {
				break;
			}
			self.store_blob(key, "KEX", round, latest.clone().into_bytes());
			self.set_stage(key, Stage::Kex { round });

			let peer_infos = self
				.collect_peer_blobs(&identity, &key.0, &peer_onions, "KEX", round)
				.await?;
			latest = self
				.wallet
				.exchange_multisig_keys(wallet_name.clone(), peer_infos, wallet_password.clone())
				.await?;
			round += 1;
		}

		self.set_stage(key, Stage::Ack);
		let address = self.wallet.get_address(wallet_name.clone()).await?;
		self.events.emit(Event::WalletAddressChanged {
			session: self.session_id(key),
			address: address.clone(),
		});

		self.set_stage(key, Stage::Pending);
		self.store_blob(key, "PENDING", 0, address.clone().into_bytes());

		self.wait_for_peer_confirmations(key, &peer_onions).await?;

		self.persist_wallet_record(key, &wallet_name, &wallet_password, &address, m).await?;
		self.set_stage(key, Stage::Complete);
		self.events.emit(Event::SessionFinished {
			session: self.session_id(key),
			reason: "multisig wallet complete".to_string(),
		});
		Ok(())
	}

	fn session_id(&self, key: &(String, String)) -> SessionId {
		self.sessions
			.lock()
			.expect("session map poisoned")
			.get(key)
			.map(|s| s.id)
			.unwrap_or_else(SessionId::next)
	}

	fn store_blob(&self, key: &(String, String), stage: &str, round: u32, blob: Vec<u8>) {
		let mut sessions = self.sessions.lock().expect("session map poisoned");
		if let Some(state) = sessions.get_mut(key) {
			state.blobs.insert((stage.to_string(), round), blob);
		}
	}

	/// `WAIT_PEERS`: polls every peer's `/api/ping` every [`PEER_POLL_INTERVAL`] until all
	/// report back the same `ref`/`m`/`n` this session was started with, meaning they've
	/// bound an identity and are ready to take part in KEX.
	async fn wait_for_peers_online(&self, identity: &Identity, reference: &str, peer_onions: &[String], m: u32, n: u32) -> Result<()> {
		for _ in 0..PEER_POLL_MAX_ATTEMPTS {
			let mut all_online = true;
			for onion in peer_onions {
				let online = match self.transport.get_signed(identity, onion, "/api/ping", reference).await {
					Ok(resp) if resp.status == 200 => resp
						.json()
						.ok()
						.map(|json| {
							json.get("ref").and_then(|v| v.as_str()) == Some(reference)
								&& json.get("m").and_then(|v| v.as_u64()) == Some(m as u64)
								&& json.get("n").and_then(|v| v.as_u64()) == Some(n as u64)
						})
						.unwrap_or(false),
					_ => false,
				};
				if !online {
					all_online = false;
				}
			}
			if all_online {
				return Ok(());
			}
			tokio::time::sleep(PEER_POLL_INTERVAL).await;
		}
		Err(WalletError::Transport("peers never came online for key exchange".into()))
	}

	async fn collect_peer_blobs(
		&self,
		identity: &crate::identity::Identity,
		reference: &str,
		peer_onions: &[String],
		stage: &str,
		round: u32,
	) -> Result<Vec<String>> {
		let mut collected = Vec::with_capacity(peer_onions.len());
		for onion in peer_onions {
			let mut attempts = 0u32;
			loop {
				match self.transport.get_blob(identity, onion, reference, stage, round).await {
					Ok(resp) if resp.status == 200 => {
						let json = resp.json()?;
						let blob_b64 = json.get("blob_b64").and_then(|v| v.as_str()).unwrap_or_default();
						let blob = crate::crypto::b64url_decode(blob_b64)?;
						collected.push(String::from_utf8(blob).map_err(|e| WalletError::Transport(e.to_string()))?);
						break;
					}
					_ => {
						attempts += 1;
						if attempts >= PEER_POLL_MAX_ATTEMPTS {
							return Err(WalletError::Transport(format!("peer {onion} never produced {stage}#{round}")));
						}
						tokio::time::sleep(PEER_POLL_INTERVAL).await;
					}
				}
			}
		}
		Ok(collected)
	}

	async fn wait_for_peer_confirmations(&self, key: &(String, String), peer_onions: &[String]) -> Result<()> {
		for _ in 0..PENDING_CONFIRM_MAX_ATTEMPTS {
			let all_confirmed = {
				let sessions = self.sessions.lock().expect("session map poisoned");
				match sessions.get(key) {
					Some(state) => peer_onions.iter().all(|p| state.pending_confirmations.contains(p)),
					None => return Err(WalletError::not_found("session vanished")),
				}
			};
			if all_confirmed {
				return Ok(());
			}
			tokio::time::sleep(PEER_POLL_INTERVAL).await;
		}
		Err(WalletError::Transport("peers never confirmed pending wallet".into()))
	}

	fn set_transfer_stage(&self, key: &(String, String), transfer_ref: &str, stage: TransferStage, status: &str) {
		let mut sessions = self.sessions.lock().expect("session map poisoned");
		if let Some(entry) = sessions.get_mut(key).and_then(|s| s.transfers.get_mut(transfer_ref)) {
			entry.stage = stage;
			entry.status = status.to_string();
		}
	}

	/// Refreshes the cached multisig-info blob for an established wallet. Called by the
	/// background key-image import loop each time it regenerates fresh info to offer
	/// peers (§4.9); never touched during initial KEX.
	pub fn set_multisig_info(&self, reference: &str, bound_onion: &str, info: Vec<u8>, ts: i64) {
		let mut sessions = self.sessions.lock().expect("session map poisoned");
		if let Some(state) = sessions.get_mut(&Self::key(reference, bound_onion)) {
			state.multisig_info = Some((info, ts));
		}
	}

	async fn persist_wallet_record(
		&self,
		key: &(String, String),
		wallet_name: &str,
		wallet_password: &str,
		address: &str,
		m: u32,
	) -> Result<()> {
		let (n, peers, creator_onion, bound_onion) = {
			let sessions = self.sessions.lock().expect("session map poisoned");
			let state = sessions.get(key).ok_or_else(|| WalletError::not_found("session vanished"))?;
			(state.n, state.peers.clone(), state.creator_onion.clone(), key.1.clone())
		};
		let (net_type, daemon_url, daemon_port, use_tor_for_daemon) = self.account.with_document(|d| {
			(
				d.settings.network_type,
				d.settings.daemon_url.clone(),
				d.settings.daemon_port,
				d.settings.use_tor_for_daemon,
			)
		});
		let socks5_addr = self.socks5_addr.clone();
		let restore_height = chain_height::resolve_robust(net_type, crate::auth::now_secs(), || async {
			chain_height::fetch_daemon_height(&daemon_url, daemon_port, use_tor_for_daemon, &socks5_addr).await
		})
		.await;
		let reference = key.0.clone();
		self.account.mutate(|doc| {
			doc.monero.wallets.push(WalletRecord {
				name: wallet_name.to_string(),
				password: wallet_password.to_string(),
				seed: String::new(),
				address: address.to_string(),
				restore_height,
				my_onion: bound_onion.clone(),
				reference: reference.clone(),
				multisig: true,
				threshold: m,
				total: peers.len() as u32,
				peers: peers.clone(),
				online: true,
				creator: creator_onion == bound_onion,
				archived: false,
				net_type,
				transfers: HashMap::new(),
			});
			Ok(())
		})
	}
}

trait IdentityLookupExt {
	fn cloned_for_session(self) -> Result<crate::identity::Identity>;
}

impl IdentityLookupExt for Option<&crate::identity::Identity> {
	fn cloned_for_session(self) -> Result<crate::identity::Identity> {
		self.cloned().ok_or_else(|| WalletError::not_found("bound identity vanished"))
	}
}

#[async_trait]
impl<W, T> SessionDirectory for SessionRegistry<W, T>
where
	W: WalletAdapterHandle + 'static,
	T: TorTransport + 'static,
{
	fn meta(&self, reference: &str, bound_onion: &str) -> Option<SessionMeta> {
		let sessions = self.sessions.lock().expect("session map poisoned");
		let state = sessions.get(&Self::key(reference, bound_onion))?;
		let nettype = self.account.with_document(|d| d.settings.network_type.as_str().to_string());
		Some(SessionMeta {
			m: state.m,
			n: state.n,
			nettype,
			stage: state.stage.name().to_string(),
		})
	}

	fn blob(&self, reference: &str, bound_onion: &str, stage: &str, round: u32) -> Option<Vec<u8>> {
		let sessions = self.sessions.lock().expect("session map poisoned");
		let state = sessions.get(&Self::key(reference, bound_onion))?;
		state.blobs.get(&(stage.to_string(), round)).cloned()
	}

	fn peers_for_ref(&self, reference: &str, bound_onion: &str) -> Vec<String> {
		let sessions = self.sessions.lock().expect("session map poisoned");
		sessions
			.get(&Self::key(reference, bound_onion))
			.map(|s| s.peers.clone())
			.unwrap_or_default()
	}

	fn register_pending_confirmation(&self, reference: &str, bound_onion: &str, peer_onion: &str) {
		let mut sessions = self.sessions.lock().expect("session map poisoned");
		if let Some(state) = sessions.get_mut(&Self::key(reference, bound_onion)) {
			state.pending_confirmations.insert(peer_onion.to_string());
		}
	}

	fn ref_exists(&self, reference: &str, bound_onion: &str) -> bool {
		self.sessions.lock().expect("session map poisoned").contains_key(&Self::key(reference, bound_onion))
			|| self
				.account
				.with_document(|d| d.monero.wallets.iter().any(|w| w.reference == reference && w.my_onion == bound_onion))
	}

	fn running(&self, reference: &str, bound_onion: &str) -> bool {
		self.sessions.lock().expect("session map poisoned").contains_key(&Self::key(reference, bound_onion))
	}

	fn start(
		&self,
		reference: &str,
		bound_onion: &str,
		m: u32,
		n: u32,
		peers: Vec<String>,
		wallet_name: String,
		wallet_password: String,
		creator_onion: String,
	) -> Result<()> {
		let key = Self::key(reference, bound_onion);
		let mut ordered = peers;
		ordered.push(bound_onion.to_string());
		ordered.sort_by_key(|s| s.to_ascii_lowercase());
		ordered.dedup_by(|a, b| a.eq_ignore_ascii_case(b));

		{
			let mut sessions = self.sessions.lock().expect("session map poisoned");
			if sessions.contains_key(&key) {
				return Ok(());
			}
			sessions.insert(
				key.clone(),
				SessionState {
					id: SessionId::next(),
					m,
					n,
					peers: ordered,
					wallet_name,
					wallet_password,
					creator_onion,
					stage: Stage::Init,
					blobs: HashMap::new(),
					pending_confirmations: HashSet::new(),
					multisig_info: None,
					transfers: HashMap::new(),
				},
			);
		}

		// `run` borrows an owning Arc through the caller, constructed at setup time where
		// SessionRegistry is always held in an Arc; see config/main wiring.
		let registry = self.self_arc();
		tokio::spawn(async move { registry.run(key).await });
		Ok(())
	}

	fn wallet_ready(&self, reference: &str, bound_onion: &str) -> bool {
		self.sessions
			.lock()
			.expect("session map poisoned")
			.get(&Self::key(reference, bound_onion))
			.map(|s| matches!(s.stage, Stage::Pending | Stage::Complete))
			.unwrap_or(false)
	}

	fn multisig_info(&self, reference: &str, bound_onion: &str) -> Option<(Vec<u8>, i64)> {
		self.sessions
			.lock()
			.expect("session map poisoned")
			.get(&Self::key(reference, bound_onion))
			.and_then(|s| s.multisig_info.clone())
	}

	fn save_incoming_transfer(
		&self,
		reference: &str,
		bound_onion: &str,
		transfer_ref: &str,
		payload: serde_json::Value,
		signing_order: Vec<String>,
		who_has_signed: Vec<String>,
	) -> Result<()> {
		let mut sessions = self.sessions.lock().expect("session map poisoned");
		let state = sessions
			.get_mut(&Self::key(reference, bound_onion))
			.ok_or_else(|| WalletError::not_found("no such session"))?;
		let transfer_blob = payload
			.get("transfer_blob")
			.and_then(|v| v.as_str())
			.unwrap_or_default()
			.to_string();
		let transfer_description = payload.get("transfer_description").cloned().unwrap_or(serde_json::Value::Null);
		let created_at = payload.get("created_at").and_then(|v| v.as_i64()).unwrap_or_else(crate::auth::now_secs);
		state.transfers.insert(
			transfer_ref.to_string(),
			TransferEntry {
				stage: TransferStage::Received,
				status: "received".to_string(),
				tx_id: String::new(),
				transfer_blob,
				signing_order,
				who_has_signed,
				transfer_description,
				created_at,
			},
		);
		Ok(())
	}

	fn saved_transfer(&self, reference: &str, bound_onion: &str, transfer_ref: &str) -> Option<(TransferStage, String, String)> {
		let sessions = self.sessions.lock().expect("session map poisoned");
		let state = sessions.get(&Self::key(reference, bound_onion))?;
		let entry = state.transfers.get(transfer_ref)?;
		Some((entry.stage, entry.status.clone(), entry.tx_id.clone()))
	}

	async fn process_incoming_transfer(&self, reference: &str, bound_onion: &str, transfer_ref: &str) -> Result<()> {
		let key = Self::key(reference, bound_onion);

		let (transfer_blob, signing_order, transfer_description, created_at) = {
			let mut sessions = self.sessions.lock().expect("session map poisoned");
			let state = sessions.get_mut(&key).ok_or_else(|| WalletError::not_found("no such session"))?;
			let entry = state
				.transfers
				.get_mut(transfer_ref)
				.ok_or_else(|| WalletError::not_found("no such transfer"))?;
			entry.stage = TransferStage::Validating;
			entry.status = "validating".to_string();
			(
				entry.transfer_blob.clone(),
				entry.signing_order.clone(),
				entry.transfer_description.clone(),
				entry.created_at,
			)
		};

		let wallet_name = self
			.account
			.with_document(|doc| {
				doc.monero
					.wallets
					.iter()
					.find(|w| w.reference == reference && w.my_onion == bound_onion)
					.map(|w| w.name.clone())
			})
			.ok_or_else(|| WalletError::not_found("no such wallet"))?;

		// Validate the blob actually parses as a transfer for this wallet before signing it.
		self.wallet.describe_transfer(wallet_name.clone(), transfer_blob.clone()).await?;

		self.set_transfer_stage(&key, transfer_ref, TransferStage::Signing, "signing");
		let (new_blob, ready_to_submit, _tx_ids) = self.wallet.sign_multisig(wallet_name.clone(), transfer_blob).await?;

		let mut who_has_signed = {
			let sessions = self.sessions.lock().expect("session map poisoned");
			sessions
				.get(&key)
				.and_then(|s| s.transfers.get(transfer_ref))
				.map(|t| t.who_has_signed.clone())
				.unwrap_or_default()
		};
		if !who_has_signed.iter().any(|s| s.eq_ignore_ascii_case(bound_onion)) {
			who_has_signed.push(bound_onion.to_string());
		}

		{
			let mut sessions = self.sessions.lock().expect("session map poisoned");
			if let Some(entry) = sessions.get_mut(&key).and_then(|s| s.transfers.get_mut(transfer_ref)) {
				entry.transfer_blob = new_blob.clone();
				entry.who_has_signed = who_has_signed.clone();
			}
		}

		if ready_to_submit {
			self.set_transfer_stage(&key, transfer_ref, TransferStage::Broadcasting, "broadcasting");
			let tx_id = self.wallet.submit_signed_multisig(wallet_name, new_blob).await?;
			let mut sessions = self.sessions.lock().expect("session map poisoned");
			if let Some(entry) = sessions.get_mut(&key).and_then(|s| s.transfers.get_mut(transfer_ref)) {
				entry.stage = TransferStage::Complete;
				entry.status = "broadcast".to_string();
				entry.tx_id = tx_id;
			}
			return Ok(());
		}

		let next_peer = signing_order
			.iter()
			.find(|o| !o.eq_ignore_ascii_case(bound_onion) && !who_has_signed.iter().any(|s| s.eq_ignore_ascii_case(o)))
			.cloned();

		self.set_transfer_stage(&key, transfer_ref, TransferStage::Submitting, "submitting");

		if let Some(next_peer) = next_peer {
			let identity = self
				.identities
				.lock()
				.expect("identity registry poisoned")
				.get(bound_onion)
				.cloned_for_session()?;
			let body = serde_json::to_vec(&serde_json::json!({
				"transfer_ref": transfer_ref,
				"transfer_blob": new_blob,
				"signing_order": signing_order,
				"who_has_signed": who_has_signed,
				"transfer_description": transfer_description,
				"created_at": created_at,
			}))?;
			crate::notifier::post_with_retry(
				self.transport.as_ref(),
				&identity,
				&next_peer,
				"/api/multisig/transfer/submit",
				reference,
				&body,
			)
			.await?;
		}

		self.set_transfer_stage(&key, transfer_ref, TransferStage::CheckingStatus, "awaiting peer status");
		Ok(())
	}
}

impl<W, T> SessionRegistry<W, T>
where
	W: WalletAdapterHandle + 'static,
	T: TorTransport + 'static,
{
	/// Recovers an owning handle so `start()` (which only gets `&self` through the
	/// trait) can hand the spawned task something it can hold across awaits. Valid
	/// because every registry is constructed through `new`, which seeds `self_ref`
	/// before handing the `Arc` out.
	fn self_arc(&self) -> Arc<Self> {
		self.self_ref
			.lock()
			.expect("self_ref mutex poisoned")
			.upgrade()
			.expect("SessionRegistry must be constructed via SessionRegistry::new")
	}
}

#[cfg(test)]
pub mod mock {
	use super::*;
	use std::sync::Mutex as StdMutex;

	/// In-memory stand-in used by router tests: no background task, just enough state
	/// to exercise validation paths.
	#[derive(Default)]
	pub struct MockSessionDirectory {
		pub metas: StdMutex<HashMap<(String, String), SessionMeta>>,
		pub peers: StdMutex<HashMap<(String, String), Vec<String>>>,
		pub running_refs: StdMutex<HashSet<(String, String)>>,
	}

	#[async_trait]
	impl SessionDirectory for MockSessionDirectory {
		fn meta(&self, reference: &str, bound_onion: &str) -> Option<SessionMeta> {
			let metas = self.metas.lock().unwrap();
			let key = (reference.to_string(), bound_onion.to_string());
			metas.get(&key).map(|m| SessionMeta {
				m: m.m,
				n: m.n,
				nettype: m.nettype.clone(),
				stage: m.stage.clone(),
			})
		}
		fn blob(&self, _reference: &str, _bound_onion: &str, _stage: &str, _round: u32) -> Option<Vec<u8>> {
			None
		}
		fn peers_for_ref(&self, reference: &str, bound_onion: &str) -> Vec<String> {
			self.peers
				.lock()
				.unwrap()
				.get(&(reference.to_string(), bound_onion.to_string()))
				.cloned()
				.unwrap_or_default()
		}
		fn register_pending_confirmation(&self, _reference: &str, _bound_onion: &str, _peer_onion: &str) {}
		fn ref_exists(&self, reference: &str, bound_onion: &str) -> bool {
			self.running_refs
				.lock()
				.unwrap()
				.contains(&(reference.to_string(), bound_onion.to_string()))
		}
		fn running(&self, reference: &str, bound_onion: &str) -> bool {
			self.ref_exists(reference, bound_onion)
		}
		fn start(
			&self,
			reference: &str,
			bound_onion: &str,
			_m: u32,
			_n: u32,
			_peers: Vec<String>,
			_wallet_name: String,
			_wallet_password: String,
			_creator_onion: String,
		) -> Result<()> {
			self.running_refs
				.lock()
				.unwrap()
				.insert((reference.to_string(), bound_onion.to_string()));
			Ok(())
		}
		fn wallet_ready(&self, _reference: &str, _bound_onion: &str) -> bool {
			false
		}
		fn multisig_info(&self, _reference: &str, _bound_onion: &str) -> Option<(Vec<u8>, i64)> {
			None
		}
		fn save_incoming_transfer(
			&self,
			_reference: &str,
			_bound_onion: &str,
			_transfer_ref: &str,
			_payload: serde_json::Value,
			_signing_order: Vec<String>,
			_who_has_signed: Vec<String>,
		) -> Result<()> {
			Ok(())
		}
		fn saved_transfer(&self, _reference: &str, _bound_onion: &str, _transfer_ref: &str) -> Option<(TransferStage, String, String)> {
			None
		}
		async fn process_incoming_transfer(&self, _reference: &str, _bound_onion: &str, _transfer_ref: &str) -> Result<()> {
			Ok(())
		}
	}
}
