use clap::App;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Runtime;

#[macro_use]
extern crate clap;

mod account;
mod auth;
mod chain_height;
mod config;
mod crypto;
mod error;
mod event;
mod identity;
mod ids;
mod ki_import;
mod notifier;
mod router;
mod server;
mod session;
mod transfer;
mod transport;
mod types;
mod wallet;

use account::AccountStore;
use config::AppConfig;
use error::WalletError;
use event::LoggingEventSink;
use identity::{Identity, IdentityRegistry};
use router::Router;
use server::InboundServer;
use session::SessionRegistry;
use transport::HttpTorTransport;
use wallet::{UnavailableWalletLibrary, WalletAdapter};

fn main() {
	env_logger::init();
	if let Err(e) = real_main() {
		log::error!("fatal: {e}");
		std::process::exit(1);
	}
}

fn real_main() -> Result<(), Box<dyn std::error::Error>> {
	let yml = load_yaml!("../oniongate.yml");
	let args = App::from_yaml(yml).get_matches();

	let config_path = args
		.value_of("config_file")
		.map(PathBuf::from)
		.unwrap_or_else(config::default_config_path);

	let network_type = if args.is_present("testnet") {
		Some(types::NetType::Testnet)
	} else if args.is_present("stagenet") {
		Some(types::NetType::Stagenet)
	} else {
		None
	};

	if let ("init-config", Some(_)) = args.subcommand() {
		if config_path.exists() {
			return Err(format!("config file already exists at {config_path:?}").into());
		}
		let mut cfg = AppConfig::default();
		cfg.apply_overrides(
			args.value_of("daemon_url"),
			args.value_of("daemon_port").and_then(|v| v.parse().ok()),
			Some(args.is_present("use_tor_for_daemon")),
			args.value_of("socks5_addr"),
			network_type,
		);
		cfg.write(&config_path)?;

		let account_path = PathBuf::from(&cfg.account_path);
		let password = prompt_password_confirm();
		AccountStore::create(&account_path, &password)?;

		println!("Configuration written to {config_path:?}; account store created at {account_path:?}.");
		return Ok(());
	}

	let mut cfg = AppConfig::load(&config_path)?;
	cfg.apply_overrides(
		args.value_of("daemon_url"),
		args.value_of("daemon_port").and_then(|v| v.parse().ok()),
		Some(args.is_present("use_tor_for_daemon")),
		args.value_of("socks5_addr"),
		network_type,
	);

	let password = prompt_password();
	let account = Arc::new(AccountStore::login(&PathBuf::from(&cfg.account_path), &password)?);

	let identities = Arc::new(Mutex::new(load_identities(&account)?));
	if identities.lock().expect("identity registry poisoned").iter().next().is_none() {
		return Err("account has no onion identities; create one before starting the server".into());
	}

	let wallet = Arc::new(WalletAdapter::new(Box::new(UnavailableWalletLibrary)));
	let transport = Arc::new(HttpTorTransport::new(cfg.socks5_addr.clone()));
	let events = Arc::new(LoggingEventSink);

	let sessions = SessionRegistry::new(
		wallet.clone(),
		transport.clone(),
		account.clone(),
		identities.clone(),
		events.clone(),
		cfg.socks5_addr.clone(),
	);

	let rt = Runtime::new()?;
	let running = Arc::new(AtomicBool::new(true));
	let running_for_handler = running.clone();
	ctrlc::set_handler(move || running_for_handler.store(false, Ordering::SeqCst))?;

	let completed_wallets: Vec<(String, String, String, Vec<String>)> = account.with_document(|doc| {
		doc.monero
			.wallets
			.iter()
			.filter(|w| w.online && !w.archived)
			.map(|w| (w.reference.clone(), w.my_onion.clone(), w.name.clone(), w.peers.clone()))
			.collect()
	});
	let ki_cache_dir = ki_import::cache_dir_for_account(&PathBuf::from(&cfg.account_path));
	for (reference, bound_onion, wallet_name, peers) in completed_wallets {
		let importer = Arc::new(ki_import::KeyImageImporter::new(
			wallet.clone(),
			transport.clone(),
			identities.clone(),
			sessions.clone(),
			ki_cache_dir.clone(),
		));
		log::info!("starting key image refresh loop for wallet '{wallet_name}'");
		rt.spawn(importer.run(reference, bound_onion, wallet_name, peers));
	}

	let onions: Vec<String> = identities.lock().expect("identity registry poisoned").onions();
	for (index, onion) in onions.into_iter().enumerate() {
		let router = Router {
			bound_onion: Mutex::new(Some(onion.clone())),
			account: account.clone(),
			identities: identities.clone(),
			sessions: sessions.clone(),
			replay: Mutex::new(auth::ReplayCache::new()),
		};
		let bind_addr = format!("127.0.0.1:{}", cfg.bind_loopback_base_port + index as u16);
		log::info!("binding {onion} to {bind_addr}");
		rt.spawn(async move {
			let server = Arc::new(InboundServer::new(router));
			if let Err(e) = server.serve(&bind_addr).await {
				log::error!("inbound server on {bind_addr} exited: {e}");
			}
		});
	}

	rt.block_on(async move {
		let mut ticker = tokio::time::interval(Duration::from_secs(1));
		while running.load(Ordering::SeqCst) {
			ticker.tick().await;
		}
		log::info!("shutdown signal received");
	});

	Ok(())
}

fn load_identities(account: &AccountStore) -> Result<IdentityRegistry, WalletError> {
	let mut registry = IdentityRegistry::new();
	let mismatched: Vec<(String, String)> = account.with_document(|doc| {
		let mut out = Vec::new();
		for record in &doc.tor_identities {
			let (identity, mismatched) = Identity::rehydrate(&record.onion_address, &record.private_key, &record.label, record.online)?;
			if mismatched {
				out.push((record.label.clone(), identity.onion_address.clone()));
			}
			registry.insert(identity);
		}
		Ok::<_, WalletError>(out)
	})?;
	for (label, onion) in mismatched {
		log::warn!("identity '{label}' re-derived to {onion}; account file will be corrected on next save");
	}
	Ok(registry)
}

fn prompt_password() -> String {
	rpassword::prompt_password_stdout("Account password: ").expect("failed to read password from terminal")
}

fn prompt_password_confirm() -> String {
	loop {
		let first = rpassword::prompt_password_stdout("New account password: ").expect("failed to read password");
		let second = rpassword::prompt_password_stdout("Confirm account password: ").expect("failed to read password");
		if first == second {
			return first;
		}
		println!("passwords did not match, try again");
	}
}
