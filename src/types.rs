//! The account document's data model (§3). Pure data — no I/O, no locking.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
	Mainnet,
	Testnet,
	Stagenet,
}

impl Default for NetType {
	fn default() -> Self {
		NetType::Mainnet
	}
}

impl NetType {
	pub fn as_str(&self) -> &'static str {
		match self {
			NetType::Mainnet => "mainnet",
			NetType::Testnet => "testnet",
			NetType::Stagenet => "stagenet",
		}
	}

	pub fn parse(s: &str) -> Option<Self> {
		match s {
			"mainnet" => Some(NetType::Mainnet),
			"testnet" => Some(NetType::Testnet),
			"stagenet" => Some(NetType::Stagenet),
			_ => None,
		}
	}
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
	pub inspect_guard: bool,
	pub daemon_url: String,
	pub daemon_port: u16,
	pub use_tor_for_daemon: bool,
	pub tor_autoconnect: bool,
	pub dark_mode: bool,
	pub lock_timeout_minutes: u32,
	pub network_type: NetType,
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			inspect_guard: true,
			daemon_url: "127.0.0.1".to_string(),
			daemon_port: 18081,
			use_tor_for_daemon: false,
			tor_autoconnect: true,
			dark_mode: false,
			lock_timeout_minutes: 30,
			network_type: NetType::Mainnet,
		}
	}
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TorIdentityRecord {
	pub onion_address: String,
	pub private_key: String,
	pub label: String,
	pub online: bool,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrustedPeer {
	pub label: String,
	pub max_n: u32,
	pub min_threshold: u32,
	pub active: bool,
	pub allowed_identities: Vec<String>,
	pub max_number_wallets: u32,
	pub current_number_wallets: u32,
}

impl Default for TrustedPeer {
	fn default() -> Self {
		TrustedPeer {
			label: String::new(),
			max_n: 1,
			min_threshold: 1,
			active: true,
			allowed_identities: Vec::new(),
			max_number_wallets: 1,
			current_number_wallets: 0,
		}
	}
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AddressBookEntry {
	pub label: String,
	pub onion: String,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct XmrAddressBookEntry {
	pub label: String,
	pub xmr_address: String,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct DaemonAddressBookEntry {
	pub label: String,
	pub url: String,
	pub port: u16,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferStage {
	Received,
	Validating,
	Signing,
	Submitting,
	CheckingStatus,
	Broadcasting,
	Complete,
	Declined,
	Error,
}

impl TransferStage {
	/// `RECEIVED < ERROR/DECLINED < CHECKING_STATUS < BROADCASTING < COMPLETE`
	pub fn rank(&self) -> u8 {
		match self {
			TransferStage::Received => 0,
			TransferStage::Validating => 0,
			TransferStage::Signing => 0,
			TransferStage::Error => 1,
			TransferStage::Declined => 1,
			TransferStage::Submitting => 1,
			TransferStage::CheckingStatus => 2,
			TransferStage::Broadcasting => 3,
			TransferStage::Complete => 4,
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			TransferStage::Complete | TransferStage::Declined | TransferStage::Error
		)
	}
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct PeerTransferStatus {
	pub stage: String,
	pub received: bool,
	pub signed: bool,
	pub status: String,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct TransferDescription {
	pub recipients: Vec<(String, u64)>,
	pub payment_id: String,
	pub fee: u64,
	pub unlock_time: u64,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TransferType {
	Simple,
	Multisig,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct TransferRecord {
	#[serde(rename = "type")]
	pub kind: TransferType,
	pub wallet_name: String,
	pub wallet_ref: String,
	pub destinations: Vec<(String, u64)>,
	pub peers: HashMap<String, PeerTransferStatus>,
	pub signing_order: Vec<String>,
	pub stage: TransferStage,
	pub status: String,
	pub signatures: Vec<String>,
	pub transfer_blob: String,
	pub transfer_description: TransferDescription,
	pub tx_id: String,
	pub created_at: i64,
	pub received_at: Option<i64>,
	pub submitted_at: Option<i64>,
	pub declined_at: Option<i64>,
	pub my_onion: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WalletRecord {
	pub name: String,
	pub password: String,
	pub seed: String,
	pub address: String,
	pub restore_height: u64,
	pub my_onion: String,
	pub reference: String,
	pub multisig: bool,
	pub threshold: u32,
	pub total: u32,
	pub peers: Vec<String>,
	pub online: bool,
	pub creator: bool,
	pub archived: bool,
	pub net_type: NetType,
	#[serde(default)]
	pub transfers: HashMap<String, TransferRecord>,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct MoneroSection {
	pub wallets: Vec<WalletRecord>,
}

#[derive(Clone, Serialize, Deserialize, Default)]
pub struct AccountDocument {
	#[serde(default)]
	pub settings: Settings,
	#[serde(default)]
	pub tor_identities: Vec<TorIdentityRecord>,
	#[serde(default)]
	pub trusted_peers: HashMap<String, TrustedPeer>,
	#[serde(default)]
	pub address_book: Vec<AddressBookEntry>,
	#[serde(default)]
	pub xmr_address_book: Vec<XmrAddressBookEntry>,
	#[serde(default)]
	pub daemon_address_book: Vec<DaemonAddressBookEntry>,
	#[serde(default)]
	pub monero: MoneroSection,
}
