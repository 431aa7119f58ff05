//! The encrypted local account store: a single in-memory JSON tree guarded by one
//! mutex, persisted through atomic replace, with a per-file lock preventing two
//! processes from holding the same account open (§4.3).

use crate::crypto::{self, KEY_BYTES};
use crate::error::{Result, WalletError};
use crate::types::AccountDocument;
use byteorder::{BigEndian, ByteOrder};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct LockFile {
	path: PathBuf,
}

impl LockFile {
	fn acquire(account_path: &Path) -> Result<Self> {
		let lock_path = account_path.with_extension("lock");
		fs::OpenOptions::new()
			.write(true)
			.create_new(true)
			.open(&lock_path)
			.map_err(|e| {
				WalletError::Persistence(format!(
					"account already open elsewhere (lock file {:?}: {e})",
					lock_path
				))
			})?;
		Ok(LockFile { path: lock_path })
	}
}

impl Drop for LockFile {
	fn drop(&mut self) {
		let _ = fs::remove_file(&self.path);
	}
}

/// Single in-memory JSON tree guarded by one mutex, matching the single-writer
/// discipline the design calls for: every mutator takes the mutex, mutates, persists,
/// and releases, rolling back to the pre-mutation image on a failed write.
pub struct AccountStore {
	path: PathBuf,
	key: [u8; KEY_BYTES],
	salt: Vec<u8>,
	_lock: LockFile,
	inner: Mutex<AccountDocument>,
}

impl AccountStore {
	/// Creates a brand-new account file with a fresh salt and an empty document.
	pub fn create(path: &Path, password: &str) -> Result<Self> {
		if path.exists() {
			return Err(WalletError::input_invalid("account file already exists"));
		}
		let salt = crypto::random_salt().to_vec();
		let key = crypto::derive_key(password, &salt)?;
		let lock = LockFile::acquire(path)?;
		let store = AccountStore {
			path: path.to_path_buf(),
			key,
			salt,
			_lock: lock,
			inner: Mutex::new(AccountDocument::default()),
		};
		store.persist()?;
		Ok(store)
	}

	/// Opens (decrypts) an existing account file. Fails if a lock file is already held.
	pub fn login(path: &Path, password: &str) -> Result<Self> {
		let raw = fs::read(path)?;
		if raw.len() < 2 {
			return Err(WalletError::Persistence("account file truncated".into()));
		}
		let salt_len = BigEndian::read_u16(&raw[0..2]) as usize;
		if raw.len() < 2 + salt_len {
			return Err(WalletError::Persistence("account file truncated".into()));
		}
		let salt = raw[2..2 + salt_len].to_vec();
		let sealed = &raw[2 + salt_len..];

		let key = crypto::derive_key(password, &salt)?;
		let plaintext = crypto::open(&key, sealed)
			.map_err(|_| WalletError::auth_failed("wrong password or corrupt account file"))?;
		let document: AccountDocument = serde_json::from_slice(&plaintext)?;

		let lock = LockFile::acquire(path)?;
		Ok(AccountStore {
			path: path.to_path_buf(),
			key,
			salt,
			_lock: lock,
			inner: Mutex::new(document),
		})
	}

	/// Writes `salt_len(u16be) || salt || nonce || ciphertext||mac` atomically: temp
	/// file, fsync, rename.
	pub fn persist(&self) -> Result<()> {
		let document = self.inner.lock().expect("account mutex poisoned");
		let plaintext = serde_json::to_vec(&*document)?;
		let sealed = crypto::seal(&self.key, &plaintext)?;

		let mut out = Vec::with_capacity(2 + self.salt.len() + sealed.len());
		let mut salt_len_buf = [0u8; 2];
		BigEndian::write_u16(&mut salt_len_buf, self.salt.len() as u16);
		out.extend_from_slice(&salt_len_buf);
		out.extend_from_slice(&self.salt);
		out.extend_from_slice(&sealed);

		let tmp_path = self.path.with_extension("tmp");
		{
			let mut tmp = fs::File::create(&tmp_path)?;
			tmp.write_all(&out)?;
			tmp.sync_all()?;
		}
		fs::rename(&tmp_path, &self.path)?;
		Ok(())
	}

	/// Runs `mutate` against a clone of the document; on success swaps it in and
	/// persists; on persist failure rolls back to the pre-mutation image.
	pub fn mutate<F, T>(&self, mutate: F) -> Result<T>
	where
		F: FnOnce(&mut AccountDocument) -> Result<T>,
	{
		let mut guard = self.inner.lock().expect("account mutex poisoned");
		let before = guard.clone_for_rollback();
		let result = mutate(&mut guard);
		match result {
			Ok(value) => {
				drop(guard);
				if let Err(e) = self.persist() {
					let mut guard = self.inner.lock().expect("account mutex poisoned");
					*guard = before;
					return Err(e);
				}
				Ok(value)
			}
			Err(e) => {
				*guard = before;
				Err(e)
			}
		}
	}

	pub fn with_document<F, T>(&self, read: F) -> T
	where
		F: FnOnce(&AccountDocument) -> T,
	{
		let guard = self.inner.lock().expect("account mutex poisoned");
		read(&guard)
	}
}

impl AccountDocument {
	fn clone_for_rollback(&self) -> AccountDocument {
		self.clone()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::TrustedPeer;
	use tempfile::tempdir;

	#[test]
	fn create_then_login_round_trips() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("account.dat");

		{
			let store = AccountStore::create(&path, "hunter2").unwrap();
			store
				.mutate(|doc| {
					doc.trusted_peers.insert(
						"abcdefghijklmnopqrstuvwxyz234567abcdefghijklmnopqrstuv.onion".to_string(),
						TrustedPeer::default(),
					);
					Ok(())
				})
				.unwrap();
		}

		let store = AccountStore::login(&path, "hunter2").unwrap();
		store.with_document(|doc| {
			assert_eq!(doc.trusted_peers.len(), 1);
		});
	}

	#[test]
	fn login_with_wrong_password_fails() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("account.dat");
		{
			AccountStore::create(&path, "correct").unwrap();
		}
		assert!(AccountStore::login(&path, "wrong").is_err());
	}

	#[test]
	fn second_login_while_first_open_is_rejected() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("account.dat");
		let _first = AccountStore::create(&path, "pw").unwrap();
		assert!(AccountStore::login(&path, "pw").is_err());
	}

	#[test]
	fn failed_mutation_is_not_persisted() {
		let dir = tempdir().unwrap();
		let path = dir.path().join("account.dat");
		let store = AccountStore::create(&path, "pw").unwrap();

		let result: Result<()> = store.mutate(|_doc| Err(WalletError::input_invalid("nope")));
		assert!(result.is_err());
		store.with_document(|doc| assert!(doc.trusted_peers.is_empty()));
	}
}
