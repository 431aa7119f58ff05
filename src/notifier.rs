//! Best-effort peer notification: retries a signed POST against a flaky onion service
//! once every five seconds, for up to an hour, before giving up. Used by the transfer
//! initiator to push a proposal to a peer that may be offline or still bootstrapping.

use crate::error::{Result, WalletError};
use crate::identity::Identity;
use crate::transport::{SignedResponse, TorTransport};
use std::time::Duration;

pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const MAX_RETRIES: u32 = 3600;

/// Posts `body` to `onion`'s `path`, retrying on transport errors and non-2xx
/// statuses until a 2xx comes back or `MAX_RETRIES` is exhausted.
pub async fn post_with_retry<T: TorTransport + ?Sized>(
	transport: &T,
	identity: &Identity,
	onion: &str,
	path: &str,
	reference: &str,
	body: &[u8],
) -> Result<SignedResponse> {
	let mut attempts = 0u32;
	loop {
		match transport.post_signed(identity, onion, path, reference, body).await {
			Ok(resp) if (200..300).contains(&resp.status) => return Ok(resp),
			Ok(resp) => {
				log::debug!("notify {onion}{path}: peer replied {} (attempt {attempts})", resp.status);
			}
			Err(e) => {
				log::debug!("notify {onion}{path}: {e} (attempt {attempts})");
			}
		}
		attempts += 1;
		if attempts >= MAX_RETRIES {
			return Err(WalletError::Transport(format!(
				"{onion}{path}: peer never acknowledged after {MAX_RETRIES} attempts"
			)));
		}
		tokio::time::sleep(RETRY_INTERVAL).await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::mock::MockTransport;

	#[tokio::test]
	async fn succeeds_immediately_when_peer_is_reachable() {
		let transport = MockTransport::default();
		transport.set_response(
			"abc.onion",
			"/api/multisig/transfer/submit",
			SignedResponse {
				status: 200,
				body: br#"{"success":true}"#.to_vec(),
			},
		);
		let identity = Identity::generate("x").unwrap();
		let resp = post_with_retry(&transport, &identity, "abc.onion", "/api/multisig/transfer/submit", "T", b"{}")
			.await
			.unwrap();
		assert_eq!(resp.status, 200);
	}
}
