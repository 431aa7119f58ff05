//! Primitives shared by the identity registry, the auth layer, and the account store:
//! Argon2id key derivation, authenticated symmetric encryption, Ed25519 detached
//! sign/verify over the raw Tor v3 "scalar || prefix" key format, onion-address
//! derivation, and the base32/base64url codecs the wire format depends on.

use crate::error::{Result, WalletError};
use curve25519_dalek::constants::ED25519_BASEPOINT_TABLE;
use curve25519_dalek::scalar::Scalar;
use data_encoding::{Encoding, Specification};
use ed25519_dalek::{ExpandedSecretKey, PublicKey, Signature, Verifier};
use rand::RngCore;
use sha2::{Digest, Sha256};
use sha3::Sha3_256;
use xsalsa20poly1305::aead::{Aead, NewAead};
use xsalsa20poly1305::{Key, XSalsa20Poly1305};

pub const SALT_BYTES: usize = 16;
pub const KEY_BYTES: usize = 32;
pub const NONCE_BYTES: usize = 24;
pub const MAC_BYTES: usize = 16;

const ONION_CHECKSUM_PREFIX: &[u8] = b".onion checksum";
const ONION_VERSION: u8 = 0x03;

lazy_static::lazy_static! {
	static ref BASE32_LOWER: Encoding = {
		let mut spec = Specification::new();
		spec.symbols.push_str("abcdefghijklmnopqrstuvwxyz234567");
		spec.encoding().expect("static base32 spec is well-formed")
	};
}

/// Derives a 32-byte symmetric key from a password and salt via Argon2id, moderate
/// ops/mem limits (matching libsodium's `crypto_pwhash` OPSLIMIT_MODERATE/MEMLIMIT_MODERATE).
pub fn derive_key(password: &str, salt: &[u8]) -> Result<[u8; KEY_BYTES]> {
	use argon2::{Algorithm, Argon2, Params, Version};

	// moderate limits: 3 passes, 256 MiB, matching libsodium's MODERATE preset closely
	// enough for an account file that is decrypted once per login, not per request.
	let params = Params::new(256 * 1024, 3, 1, Some(KEY_BYTES))
		.map_err(|e| WalletError::Crypto(format!("argon2 params: {e}")))?;
	let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
	let mut out = [0u8; KEY_BYTES];
	argon2
		.hash_password_into(password.as_bytes(), salt, &mut out)
		.map_err(|e| WalletError::Crypto(format!("argon2: {e}")))?;
	Ok(out)
}

pub fn random_salt() -> [u8; SALT_BYTES] {
	let mut salt = [0u8; SALT_BYTES];
	rand::thread_rng().fill_bytes(&mut salt);
	salt
}

/// Authenticated-encrypts `plaintext` under `key`, generating a fresh nonce. Returns
/// `nonce || ciphertext || mac`.
pub fn seal(key: &[u8; KEY_BYTES], plaintext: &[u8]) -> Result<Vec<u8>> {
	let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
	let mut nonce_bytes = [0u8; NONCE_BYTES];
	rand::thread_rng().fill_bytes(&mut nonce_bytes);
	let nonce = xsalsa20poly1305::Nonce::from_slice(&nonce_bytes);
	let ciphertext = cipher
		.encrypt(nonce, plaintext)
		.map_err(|_| WalletError::Crypto("secretbox encrypt failed".into()))?;
	let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
	out.extend_from_slice(&nonce_bytes);
	out.extend_from_slice(&ciphertext);
	Ok(out)
}

/// Opens a blob produced by [`seal`]: `nonce || ciphertext || mac`.
pub fn open(key: &[u8; KEY_BYTES], sealed: &[u8]) -> Result<Vec<u8>> {
	if sealed.len() < NONCE_BYTES + MAC_BYTES {
		return Err(WalletError::Crypto("sealed blob too short".into()));
	}
	let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_BYTES);
	let cipher = XSalsa20Poly1305::new(Key::from_slice(key));
	let nonce = xsalsa20poly1305::Nonce::from_slice(nonce_bytes);
	cipher
		.decrypt(nonce, ciphertext)
		.map_err(|_| WalletError::Crypto("secretbox decrypt failed (bad password or corrupt file)".into()))
}

/// Derives the Ed25519 public key from a raw, unclamped 32-byte scalar: `A = scalar * B`.
/// This is the no-clamp basepoint multiplication Tor v3 onion identities use, matching
/// libsodium's `crypto_scalarmult_ed25519_base_noclamp`.
pub fn pubkey_from_scalar(scalar: &[u8; 32]) -> [u8; 32] {
	let s = Scalar::from_bits(*scalar);
	let point = &s * &ED25519_BASEPOINT_TABLE;
	point.compress().to_bytes()
}

/// Signs `msg` with an identity's raw `scalar || prefix` (64 bytes), matching the
/// manual Ed25519 algorithm Tor onion services use rather than the seed-derived form.
pub fn sign(scalar_prefix: &[u8; 64], pubkey: &[u8; 32], msg: &[u8]) -> Result<[u8; 64]> {
	let expanded = ExpandedSecretKey::from_bytes(scalar_prefix)
		.map_err(|e| WalletError::Crypto(format!("bad expanded key: {e}")))?;
	let public = PublicKey::from_bytes(pubkey)
		.map_err(|e| WalletError::Crypto(format!("bad public key: {e}")))?;
	let sig = expanded.sign(msg, &public);
	Ok(sig.to_bytes())
}

pub fn verify(pubkey: &[u8; 32], msg: &[u8], sig: &[u8; 64]) -> bool {
	let public = match PublicKey::from_bytes(pubkey) {
		Ok(p) => p,
		Err(_) => return false,
	};
	let signature = match Signature::from_bytes(sig) {
		Ok(s) => s,
		Err(_) => return false,
	};
	public.verify(msg, &signature).is_ok()
}

/// `onion = base32(pub || sha3_256(".onion checksum" || pub || 0x03)[:2] || 0x03) + ".onion"`
pub fn onion_from_pub(pub32: &[u8; 32]) -> String {
	let mut hasher = Sha3_256::new();
	hasher.update(ONION_CHECKSUM_PREFIX);
	hasher.update(pub32);
	hasher.update([ONION_VERSION]);
	let digest = hasher.finalize();

	let mut full = Vec::with_capacity(32 + 2 + 1);
	full.extend_from_slice(pub32);
	full.extend_from_slice(&digest[..2]);
    full.push(ONION_VERSION);

	format!("{}.onion", BASE32_LOWER.encode(&full).to_lowercase())
}

pub fn sha256_hex(data: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(data);
	hex_lower(&hasher.finalize())
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
	let mut hasher = Sha256::new();
	hasher.update(data);
	let out = hasher.finalize();
	let mut buf = [0u8; 32];
	buf.copy_from_slice(&out);
	buf
}

pub fn hex_lower(bytes: &[u8]) -> String {
	bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub fn b64url_encode(bytes: &[u8]) -> String {
	base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

/// Decodes base64url-no-pad; tolerates base64url-with-padding and standard base64 as
/// compatibility fallbacks, matching the flexible decoding the account blob parser uses.
pub fn b64url_decode(s: &str) -> Result<Vec<u8>> {
	let s = s.trim();
	base64::decode_config(s, base64::URL_SAFE_NO_PAD)
		.or_else(|_| base64::decode_config(s, base64::URL_SAFE))
		.or_else(|_| base64::decode_config(s, base64::STANDARD))
		.or_else(|_| base64::decode_config(s, base64::STANDARD_NO_PAD))
		.map_err(|e| WalletError::input_invalid(format!("bad base64: {e}")))
}

/// Splits a `ED25519-V3:`-prefixed (or bare) base64 blob into `(scalar, prefix, pubkey)`,
/// tolerating both standard and url-safe base64, mirroring the flexible parser the
/// original account format used for imported identities.
pub fn split_v3_blob(blob: &str) -> Result<([u8; 32], [u8; 32], [u8; 32])> {
	let stripped = blob.trim();
	let stripped = stripped
		.strip_prefix("ED25519-V3:")
		.or_else(|| {
			let lower = stripped.to_ascii_lowercase();
			if lower.starts_with("ed25519-v3:") {
				Some(&stripped[11..])
			} else {
				None
			}
		})
		.unwrap_or(stripped);

	let raw = base64::decode_config(stripped, base64::STANDARD)
		.or_else(|_| base64::decode_config(stripped, base64::URL_SAFE))
		.or_else(|_| base64::decode_config(stripped, base64::STANDARD_NO_PAD))
		.or_else(|_| base64::decode_config(stripped, base64::URL_SAFE_NO_PAD))
		.map_err(|e| WalletError::input_invalid(format!("bad identity blob base64: {e}")))?;

	if raw.len() != 64 {
		return Err(WalletError::input_invalid(format!(
			"identity blob must decode to 64 bytes, got {}",
			raw.len()
		)));
	}
	let mut scalar = [0u8; 32];
	let mut prefix = [0u8; 32];
	scalar.copy_from_slice(&raw[..32]);
	prefix.copy_from_slice(&raw[32..64]);
	let pubkey = pubkey_from_scalar(&scalar);
	Ok((scalar, prefix, pubkey))
}

pub fn encode_v3_blob(scalar: &[u8; 32], prefix: &[u8; 32]) -> String {
	let mut raw = Vec::with_capacity(64);
	raw.extend_from_slice(scalar);
	raw.extend_from_slice(prefix);
	format!("ED25519-V3:{}", base64::encode_config(&raw, base64::STANDARD))
}

/// Normalizes an onion reference: trim, lowercase, append `.onion` if absent.
pub fn normalize_onion(raw: &str) -> String {
	let mut s = raw.trim().to_ascii_lowercase();
	if !s.ends_with(".onion") {
		s.push_str(".onion");
	}
	s
}

/// 56 chars of `[a-z2-7]` followed by `.onion`.
pub fn is_valid_onion_v3(addr: &str) -> bool {
	let addr = addr.trim();
	match addr.strip_suffix(".onion") {
		Some(label) => {
			label.len() == 56 && label.bytes().all(|b| matches!(b, b'a'..=b'z' | b'2'..=b'7'))
		}
		None => false,
	}
}

#[cfg(test)]
pub mod test_util {
	use super::*;

	pub fn rand_identity() -> ([u8; 32], [u8; 32], [u8; 32], String) {
		let mut scalar = [0u8; 32];
		let mut prefix = [0u8; 32];
		rand::thread_rng().fill_bytes(&mut scalar);
		rand::thread_rng().fill_bytes(&mut prefix);
		let pubkey = pubkey_from_scalar(&scalar);
		let onion = onion_from_pub(&pubkey);
		(scalar, prefix, pubkey, onion)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn seal_open_roundtrip() {
		let key = derive_key("hunter2", &random_salt()).unwrap();
		let plaintext = b"{\"settings\":{}}".to_vec();
		let sealed = seal(&key, &plaintext).unwrap();
		let opened = open(&key, &sealed).unwrap();
		assert_eq!(opened, plaintext);
	}

	#[test]
	fn open_rejects_wrong_key() {
		let key1 = derive_key("a", &random_salt()).unwrap();
		let key2 = derive_key("b", &random_salt()).unwrap();
		let sealed = seal(&key1, b"secret").unwrap();
		assert!(open(&key2, &sealed).is_err());
	}

	#[test]
	fn sign_verify_roundtrip() {
		let (scalar, prefix, pubkey, _onion) = test_util::rand_identity();
		let mut scalar_prefix = [0u8; 64];
		scalar_prefix[..32].copy_from_slice(&scalar);
		scalar_prefix[32..].copy_from_slice(&prefix);

		let msg = b"canonical message bytes";
		let sig = sign(&scalar_prefix, &pubkey, msg).unwrap();
		assert!(verify(&pubkey, msg, &sig));
		assert!(!verify(&pubkey, b"tampered", &sig));
	}

	#[test]
	fn onion_from_pub_is_56_chars_plus_suffix() {
		let (_scalar, _prefix, pubkey, onion) = test_util::rand_identity();
		assert!(is_valid_onion_v3(&onion), "invalid onion: {onion}");
		assert_eq!(onion, onion_from_pub(&pubkey));
	}

	#[test]
	fn v3_blob_roundtrip() {
		let (scalar, prefix, pubkey, _onion) = test_util::rand_identity();
		let blob = encode_v3_blob(&scalar, &prefix);
		let (s2, p2, pub2) = split_v3_blob(&blob).unwrap();
		assert_eq!(scalar, s2);
		assert_eq!(prefix, p2);
		assert_eq!(pubkey, pub2);
	}

	#[test]
	fn normalize_onion_adds_suffix_and_lowercases() {
		assert_eq!(normalize_onion(" ABCDEF.ONION "), "abcdef.onion");
		assert_eq!(
			normalize_onion("abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuv"),
			"abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuv.onion"
		);
	}

	#[test]
	fn b64url_decode_tolerates_standard_padding() {
		let bytes = b"hello world, this needs padding!!";
		let std_padded = base64::encode_config(bytes, base64::STANDARD);
		assert_eq!(b64url_decode(&std_padded).unwrap(), bytes);

		let url_nopad = b64url_encode(bytes);
		assert_eq!(b64url_decode(&url_nopad).unwrap(), bytes);
	}
}
