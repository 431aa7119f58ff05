//! Restore-height resolution (§4.11): daemon RPC first, wall-clock anchor estimate
//! as fallback.

use crate::types::NetType;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request};
use hyper_socks2::SocksConnector;
use hyper_timeout::TimeoutConnector;
use std::time::Duration;

pub const TARGET_SECS_PER_BLOCK_MAINNET: i64 = 120;
pub const TARGET_SECS_PER_BLOCK_OTHER: i64 = 150;
const SAFETY_BLOCKS: i64 = 7 * 720;
const DAEMON_TIMEOUT: Duration = Duration::from_secs(10);

struct Anchor {
	height: i64,
	ts: i64,
}

fn anchor_for(net: NetType) -> Anchor {
	match net {
		NetType::Mainnet => Anchor {
			height: 1_009_827,
			ts: 1_458_748_658,
		},
		NetType::Testnet => Anchor {
			height: 2_862_744,
			ts: 1_761_436_800,
		},
		NetType::Stagenet => Anchor {
			height: 1_977_817,
			ts: 1_761_436_800,
		},
	}
}

fn secs_per_block(net: NetType) -> i64 {
	match net {
		NetType::Mainnet => TARGET_SECS_PER_BLOCK_MAINNET,
		NetType::Testnet | NetType::Stagenet => TARGET_SECS_PER_BLOCK_OTHER,
	}
}

/// Estimates the current chain height from wall-clock time using a network-specific
/// anchor, minus a one-week safety buffer, clamped to zero.
pub fn estimate_from_timestamp(now_ts: i64, net: NetType) -> u64 {
	let anchor = anchor_for(net);
	let spb = secs_per_block(net);
	let dt = now_ts - anchor.ts;
	let delta_blocks = if dt <= 0 { 0 } else { dt / spb };
	let estimated = anchor.height + delta_blocks - SAFETY_BLOCKS;
	estimated.max(0) as u64
}

/// The two-step robust resolution strategy: try the daemon, then fall back to the
/// wall-clock estimate. `query_daemon` is injected so the caller can route it through
/// SOCKS5 when the daemon URL is an onion and `use_tor_for_daemon` is set.
pub async fn resolve_robust<F, Fut>(net: NetType, now_ts: i64, query_daemon: F) -> u64
where
	F: FnOnce() -> Fut,
	Fut: std::future::Future<Output = Option<u64>>,
{
	if let Some(height) = query_daemon().await {
		if height > 0 {
			return height;
		}
	}
	estimate_from_timestamp(now_ts, net)
}

async fn get_body<C>(client: Client<C>, uri: &str) -> Option<Vec<u8>>
where
	C: hyper::client::connect::Connect + Clone + Send + Sync + 'static,
{
	let request = Request::builder().method("GET").uri(uri).body(Body::empty()).ok()?;
	let response = client.request(request).await.ok()?;
	if !response.status().is_success() {
		return None;
	}
	hyper::body::to_bytes(response.into_body()).await.ok().map(|b| b.to_vec())
}

/// Queries a Monero daemon's `/get_height` endpoint, routing through `socks5_addr` when
/// `use_tor_for_daemon` is set and the daemon host is itself a `.onion`. Returns `None`
/// on any connection, timeout, or parse failure so the caller falls back to the
/// wall-clock estimate.
pub async fn fetch_daemon_height(daemon_url: &str, daemon_port: u16, use_tor_for_daemon: bool, socks5_addr: &str) -> Option<u64> {
	let host = daemon_url.trim_start_matches("http://").trim_start_matches("https://");
	let uri = format!("http://{host}:{daemon_port}/get_height");

	let body = if use_tor_for_daemon && host.ends_with(".onion") {
		let mut http = HttpConnector::new();
		http.enforce_http(false);
		let socks = SocksConnector {
			proxy_addr: socks5_addr.parse().ok()?,
			auth: None,
			connector: http,
		};
		let mut timeout = TimeoutConnector::new(socks);
		timeout.set_connect_timeout(Some(DAEMON_TIMEOUT));
		timeout.set_read_timeout(Some(DAEMON_TIMEOUT));
		timeout.set_write_timeout(Some(DAEMON_TIMEOUT));
		get_body(Client::builder().build(timeout), &uri).await?
	} else {
		let http = HttpConnector::new();
		let mut timeout = TimeoutConnector::new(http);
		timeout.set_connect_timeout(Some(DAEMON_TIMEOUT));
		timeout.set_read_timeout(Some(DAEMON_TIMEOUT));
		timeout.set_write_timeout(Some(DAEMON_TIMEOUT));
		get_body(Client::builder().build(timeout), &uri).await?
	};

	let json: serde_json::Value = serde_json::from_slice(&body).ok()?;
	json.get("height").and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn estimate_clamps_to_zero_for_timestamps_before_anchor() {
		let height = estimate_from_timestamp(0, NetType::Mainnet);
		assert_eq!(height, 0);
	}

	#[test]
	fn estimate_grows_with_elapsed_time() {
		let anchor = anchor_for(NetType::Mainnet);
		let later = anchor.ts + 1_000_000;
		let height = estimate_from_timestamp(later, NetType::Mainnet);
		assert!(height > 0);
	}

	#[tokio::test]
	async fn resolve_robust_prefers_daemon_when_available() {
		let height = resolve_robust(NetType::Mainnet, 2_000_000_000, || async { Some(3_000_000u64) }).await;
		assert_eq!(height, 3_000_000);
	}

	#[tokio::test]
	async fn resolve_robust_falls_back_when_daemon_unavailable() {
		let height = resolve_robust(NetType::Mainnet, 2_000_000_000, || async { None }).await;
		assert!(height > 0);
	}
}
