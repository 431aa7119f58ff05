use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! stable_id {
	($name:ident, $counter:ident) => {
		/// Stable arena key. Replaces shared-pointer graphs across threads: components
		/// hold this instead of a reference to each other and look each other up through
		/// a table guarded by the owning store's mutex.
		#[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
		pub struct $name(u64);

		static $counter: AtomicU64 = AtomicU64::new(1);

		impl $name {
			pub fn next() -> Self {
				$name($counter.fetch_add(1, Ordering::Relaxed))
			}
		}

		impl fmt::Debug for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}({})", stringify!($name), self.0)
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}
	};
}

stable_id!(SessionId, SESSION_ID_COUNTER);
stable_id!(TransferId, TRANSFER_ID_COUNTER);
stable_id!(WalletId, WALLET_ID_COUNTER);

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn ids_are_distinct_and_monotonic() {
		let a = SessionId::next();
		let b = SessionId::next();
		assert_ne!(a, b);
		assert!(format!("{:?}", a).starts_with("SessionId"));
	}
}
