//! Owned onion identities: the set of Ed25519 keys this node can sign with, and the
//! resolver used to answer "which of my identities owns this wallet/session".

use crate::crypto;
use crate::error::{Result, WalletError};
use serde::{Deserialize, Serialize};

/// A single owned identity: raw scalar/prefix key material plus the onion address it
/// resolves to. `private_key` on disk is `ED25519-V3:base64(scalar||prefix)`.
#[derive(Clone, Serialize, Deserialize)]
pub struct Identity {
	pub onion_address: String,
	pub private_key: String,
	pub label: String,
	pub online: bool,

	#[serde(skip)]
	scalar: [u8; 32],
	#[serde(skip)]
	prefix: [u8; 32],
	#[serde(skip)]
	pubkey: [u8; 32],
}

impl Identity {
	pub fn from_blob(private_key: &str, label: &str, online: bool) -> Result<Self> {
		let (scalar, prefix, pubkey) = crypto::split_v3_blob(private_key)?;
		let derived_onion = crypto::onion_from_pub(&pubkey);
		Ok(Identity {
			onion_address: derived_onion,
			private_key: private_key.to_string(),
			label: label.to_string(),
			online,
			scalar,
			prefix,
			pubkey,
		})
	}

	/// Rehydrates an identity loaded from disk. If the stored `onion_address` disagrees
	/// with the address derived from the key material, the derived one wins (per the
	/// mismatch-tolerant load rule) and the caller should re-persist.
	pub fn rehydrate(stored_onion: &str, private_key: &str, label: &str, online: bool) -> Result<(Self, bool)> {
		let identity = Self::from_blob(private_key, label, online)?;
		let mismatched = !stored_onion.is_empty()
			&& crypto::normalize_onion(stored_onion) != identity.onion_address;
		if mismatched {
			log::warn!(
				"identity '{label}': stored onion {stored_onion} does not match derived {}; using derived",
				identity.onion_address
			);
		}
		Ok((identity, mismatched))
	}

	pub fn generate(label: &str) -> Result<Self> {
		use rand::RngCore;
		let mut scalar = [0u8; 32];
		let mut prefix = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut scalar);
		rand::thread_rng().fill_bytes(&mut prefix);
		let blob = crypto::encode_v3_blob(&scalar, &prefix);
		Self::from_blob(&blob, label, false)
	}

	pub fn pubkey(&self) -> &[u8; 32] {
		&self.pubkey
	}

	pub fn sign(&self, msg: &[u8]) -> Result<[u8; 64]> {
		let mut scalar_prefix = [0u8; 64];
		scalar_prefix[..32].copy_from_slice(&self.scalar);
		scalar_prefix[32..].copy_from_slice(&self.prefix);
		crypto::sign(&scalar_prefix, &self.pubkey, msg)
	}
}

/// Owned-identity set with label uniquification on insert, matching the account
/// store's `tor_identities` sequence.
#[derive(Default)]
pub struct IdentityRegistry {
	identities: Vec<Identity>,
}

impl IdentityRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn insert(&mut self, mut identity: Identity) {
		identity.label = self.uniquify_label(&identity.label);
		self.identities.push(identity);
	}

	fn uniquify_label(&self, base: &str) -> String {
		if !self.label_taken(base) {
			return base.to_string();
		}
		let mut n = 2;
		loop {
			let candidate = format!("{base}-{n}");
			if !self.label_taken(&candidate) {
				return candidate;
			}
			n += 1;
		}
	}

	fn label_taken(&self, label: &str) -> bool {
		self.identities
			.iter()
			.any(|i| i.label.eq_ignore_ascii_case(label))
	}

	pub fn owns(&self, onion: &str) -> bool {
		let onion = crypto::normalize_onion(onion);
		self.identities.iter().any(|i| i.onion_address == onion)
	}

	pub fn get(&self, onion: &str) -> Option<&Identity> {
		let onion = crypto::normalize_onion(onion);
		self.identities.iter().find(|i| i.onion_address == onion)
	}

	pub fn remove(&mut self, onion: &str) -> Result<()> {
		let onion = crypto::normalize_onion(onion);
		let before = self.identities.len();
		self.identities.retain(|i| i.onion_address != onion);
		if self.identities.len() == before {
			return Err(WalletError::not_found(format!("no identity for {onion}")));
		}
		Ok(())
	}

	pub fn iter(&self) -> impl Iterator<Item = &Identity> {
		self.identities.iter()
	}

	pub fn onions(&self) -> Vec<String> {
		self.identities.iter().map(|i| i.onion_address.clone()).collect()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn labels_are_uniquified_on_insert() {
		let mut reg = IdentityRegistry::new();
		reg.insert(Identity::generate("main").unwrap());
		reg.insert(Identity::generate("Main").unwrap());
		reg.insert(Identity::generate("main").unwrap());
		let labels: Vec<_> = reg.iter().map(|i| i.label.clone()).collect();
		assert_eq!(labels, vec!["main", "main-2", "main-3"]);
	}

	#[test]
	fn owns_checks_normalized_onion() {
		let mut reg = IdentityRegistry::new();
		let id = Identity::generate("a").unwrap();
		let onion = id.onion_address.clone();
		reg.insert(id);
		assert!(reg.owns(&onion.to_uppercase()));
		assert!(!reg.owns("nonexistent234567890123456789012345678901234567.onion"));
	}

	#[test]
	fn sign_verify_via_identity() {
		let id = Identity::generate("a").unwrap();
		let sig = id.sign(b"hello").unwrap();
		assert!(crypto::verify(id.pubkey(), b"hello", &sig));
	}
}
