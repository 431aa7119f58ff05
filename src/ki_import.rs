//! Background partial-key-image import (§4.9): once a multisig wallet is complete,
//! each signer periodically refreshes its own multisig-info blob and pulls every
//! peer's latest blob in to stay able to see incoming funds and build transfers.
//! Runs as a long-lived task per wallet, independent of any single transfer.

use crate::error::Result;
use crate::identity::IdentityRegistry;
use crate::session::SessionRegistry;
use crate::transport::TorTransport;
use crate::wallet::WalletAdapterHandle;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const REFRESH_INTERVAL: Duration = Duration::from_secs(120);

/// A peer's cached multisig-info blob older than this is no longer trusted and must
/// be re-fetched before it can be bulk-imported.
const STALENESS_SECS: i64 = 120;

#[derive(Default, Clone, Serialize, Deserialize)]
struct CachedPeerInfo {
	info: String,
	ts: i64,
	imported: bool,
}

type PeerInfoCache = HashMap<String, CachedPeerInfo>;

pub struct KeyImageImporter<W, T> {
	wallet: Arc<W>,
	transport: Arc<T>,
	identities: Arc<Mutex<IdentityRegistry>>,
	sessions: Arc<SessionRegistry<W, T>>,
	cache_dir: PathBuf,
}

impl<W, T> KeyImageImporter<W, T>
where
	W: WalletAdapterHandle + 'static,
	T: TorTransport + 'static,
{
	pub fn new(
		wallet: Arc<W>,
		transport: Arc<T>,
		identities: Arc<Mutex<IdentityRegistry>>,
		sessions: Arc<SessionRegistry<W, T>>,
		cache_dir: PathBuf,
	) -> Self {
		KeyImageImporter {
			wallet,
			transport,
			identities,
			sessions,
			cache_dir,
		}
	}

	/// Runs forever, regenerating `wallet_name`'s multisig info every
	/// [`REFRESH_INTERVAL`] and pulling every peer's current blob in via
	/// `import_multisig_bulk`. Intended to be spawned once per completed wallet.
	pub async fn run(self: Arc<Self>, reference: String, bound_onion: String, wallet_name: String, peers: Vec<String>) {
		loop {
			if let Err(e) = self.refresh_once(&reference, &bound_onion, &wallet_name, &peers).await {
				log::warn!("key image refresh for {wallet_name} failed: {e}");
			}
			tokio::time::sleep(REFRESH_INTERVAL).await;
		}
	}

	fn cache_path(&self, wallet_name: &str) -> PathBuf {
		self.cache_dir.join(format!("{wallet_name}.peer_infos.json"))
	}

	fn load_cache(&self, wallet_name: &str) -> PeerInfoCache {
		let path = self.cache_path(wallet_name);
		std::fs::read_to_string(&path)
			.ok()
			.and_then(|text| serde_json::from_str(&text).ok())
			.unwrap_or_default()
	}

	fn save_cache(&self, wallet_name: &str, cache: &PeerInfoCache) -> Result<()> {
		std::fs::create_dir_all(&self.cache_dir)?;
		let text = serde_json::to_string(cache)?;
		std::fs::write(self.cache_path(wallet_name), text)?;
		Ok(())
	}

	async fn refresh_once(&self, reference: &str, bound_onion: &str, wallet_name: &str, peers: &[String]) -> Result<()> {
		let (info, ts) = self.wallet.prepare_multisig_info(wallet_name.to_string()).await?;
		self.sessions.set_multisig_info(reference, bound_onion, info.clone().into_bytes(), ts);

		// Already holding a full set of imported partial key images for this round;
		// nothing to fetch until a transfer consumes them.
		if self.wallet.has_multisig_partial_key_images(wallet_name.to_string()).await? {
			return Ok(());
		}

		let identity = self.identities.lock().expect("identity registry poisoned").get(bound_onion).cloned();
		let Some(identity) = identity else {
			return Ok(());
		};

		let mut cache = self.load_cache(wallet_name);

		for peer in peers {
			match self.transport.get_signed(&identity, peer, "/api/multisig/transfer/request_info", reference).await {
				Ok(resp) if resp.status == 200 => {
					let json = resp.json()?;
					let Some(info_b64) = json.get("multisig_info_b64").and_then(|v| v.as_str()) else {
						continue;
					};
					let Ok(bytes) = crate::crypto::b64url_decode(info_b64) else { continue };
					let Ok(text) = String::from_utf8(bytes) else { continue };
					let peer_ts = json.get("time").and_then(|v| v.as_i64()).unwrap_or_else(crate::auth::now_secs);

					let entry = cache.entry(peer.clone()).or_default();
					if entry.info != text {
						entry.imported = false;
					}
					entry.info = text;
					entry.ts = peer_ts;
				}
				Ok(resp) => log::debug!("peer {peer} request_info returned {}", resp.status),
				Err(e) => log::debug!("peer {peer} request_info failed: {e}"),
			}
		}

		self.save_cache(wallet_name, &cache)?;

		let now = crate::auth::now_secs();
		let all_fresh_and_unimported = peers
			.iter()
			.all(|p| cache.get(p).map(|e| !e.imported && now - e.ts <= STALENESS_SECS).unwrap_or(false));

		if all_fresh_and_unimported {
			let infos: Vec<String> = peers.iter().filter_map(|p| cache.get(p).map(|e| e.info.clone())).collect();
			self.wallet.import_multisig_bulk(wallet_name.to_string(), infos).await?;
			for peer in peers {
				if let Some(entry) = cache.get_mut(peer) {
					entry.imported = true;
				}
			}
			self.save_cache(wallet_name, &cache)?;
		}

		Ok(())
	}
}

/// Derives the on-disk directory for per-wallet peer-info caches from the account
/// file's location: a `ki_cache` sibling directory, so it travels with the account
/// but never mixes into the account file itself.
pub fn cache_dir_for_account(account_path: &Path) -> PathBuf {
	account_path.parent().unwrap_or_else(|| Path::new(".")).join("ki_cache")
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::account::AccountStore;
	use crate::transport::mock::MockTransport;
	use crate::transport::SignedResponse;
	use crate::wallet::mock::MockWalletLibrary;
	use crate::wallet::WalletAdapter;
	use tempfile::tempdir;

	fn identity_for(onion: &str) -> crate::identity::Identity {
		let identity = crate::identity::Identity::generate("main").unwrap();
		let _ = onion;
		identity
	}

	#[tokio::test]
	async fn gates_import_until_all_peers_are_fresh() {
		let dir = tempdir().unwrap();
		let account = Arc::new(AccountStore::create(&dir.path().join("a.dat"), "pw").unwrap());
		let identity = identity_for("self");
		let bound_onion = identity.onion_address.clone();
		let mut registry = IdentityRegistry::new();
		registry.insert(identity);
		let identities = Arc::new(Mutex::new(registry));

		let wallet = Arc::new(WalletAdapter::new(Box::new(MockWalletLibrary::default())));
		let transport = Arc::new(MockTransport::default());
		let events = Arc::new(crate::event::LoggingEventSink);
		let sessions = SessionRegistry::new(
			wallet.clone(),
			transport.clone(),
			account.clone(),
			identities.clone(),
			events,
			"127.0.0.1:9050".to_string(),
		);

		transport.set_response(
			"peera.onion",
			"/api/multisig/transfer/request_info",
			SignedResponse {
				status: 200,
				body: br#"{"multisig_info_b64":"a2V4LWluZm8","time":9999999999}"#.to_vec(),
			},
		);
		// peerb never answers -> stays out of the cache, so the gate never opens.

		let importer = Arc::new(KeyImageImporter::new(
			wallet,
			transport,
			identities,
			sessions,
			cache_dir_for_account(&dir.path().join("a.dat")),
		));

		importer
			.refresh_once("T", &bound_onion, "w1", &["peera.onion".to_string(), "peerb.onion".to_string()])
			.await
			.unwrap();

		let cache = importer.load_cache("w1");
		assert!(cache.get("peera.onion").is_some());
		assert!(cache.get("peerb.onion").is_none());
	}
}
