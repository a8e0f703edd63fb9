//! Account pool for Warp upstream credentials
//!
//! Manages multiple Warp accounts with strategy-based selection, a per-account
//! health state machine, and one-JSON-file-per-account persistence. The store
//! holds only the durable subset (name, refresh token, enabled flag, status
//! marks); JWTs, session cookies and counters are process-local and rebuilt
//! on demand.
//!
//! Account lifecycle:
//! 1. Admin adds an account (or it is loaded from the accounts directory)
//! 2. The selector picks it under the pool mutex when `is_available()`
//! 3. Upstream 429 → RateLimited until the retry interval elapses
//! 4. Upstream 403 → Blocked until deleted or manually re-enabled
//! 5. Quota phrases / used ≥ limit → QuotaExhausted until the next month
//! 6. Status marks persist immediately; recovery is lazy at query time

pub mod account;
pub mod error;
pub mod pool;
pub mod refresh;
pub mod store;

pub use account::{Account, AccountStatus, DurableRecord, SharedAccount};
pub use error::{Error, Result};
pub use pool::{Pool, PoolPolicy, Strategy};
pub use refresh::refresh_all_tokens;
pub use store::AccountStore;
