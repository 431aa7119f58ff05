use thiserror::Error;

/// Top-level error currency for every fallible public operation in the crate.
///
/// Crossing a channel boundary (worker thread -> session main context) always carries
/// one of these variants rather than a string, so state machines can match on kind.
#[derive(Error, Debug)]
pub enum WalletError {
	#[error("input invalid: {0}")]
	InputInvalid(String),

	#[error("authentication failed: {0}")]
	AuthFailed(String),

	#[error("policy violated: {0}")]
	PolicyViolated(String),

	#[error("transport error: {0}")]
	Transport(String),

	#[error("wallet library error during {operation}: {message}")]
	WalletLibrary { operation: String, message: String },

	#[error("persistence failed: {0}")]
	Persistence(String),

	#[error("not found: {0}")]
	NotFound(String),

	#[error("crypto error: {0}")]
	Crypto(String),

	#[error("io error: {0}")]
	Io(#[from] std::io::Error),

	#[error("json error: {0}")]
	Json(#[from] serde_json::Error),
}

impl WalletError {
	pub fn input_invalid<S: Into<String>>(msg: S) -> Self {
		WalletError::InputInvalid(msg.into())
	}

	pub fn auth_failed<S: Into<String>>(msg: S) -> Self {
		WalletError::AuthFailed(msg.into())
	}

	pub fn policy_violated<S: Into<String>>(msg: S) -> Self {
		WalletError::PolicyViolated(msg.into())
	}

	pub fn not_found<S: Into<String>>(msg: S) -> Self {
		WalletError::NotFound(msg.into())
	}

	/// Whether this kind of failure should retry on a timer (transient transport)
	/// or should abort outright (auth/policy/input).
	pub fn is_retryable(&self) -> bool {
		matches!(self, WalletError::Transport(_))
	}
}

pub type Result<T> = std::result::Result<T, WalletError>;
