//! Client login handshake
//!
//! Before the AI endpoint accepts requests the client must complete a login
//! POST carrying the JWT plus a per-session experiment id/bucket pair. The
//! server answers 204 and sets session cookies; the caller's HTTP client
//! must have a cookie store enabled so the cookies ride along on subsequent
//! AI calls.

use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::constants::{CLIENT_ID, CLIENT_VERSION, LOGIN_ENDPOINT, OS_CATEGORY, OS_NAME, OS_VERSION};
use crate::error::{Error, Result};

/// Experiment headers generated once per login.
#[derive(Debug, Clone)]
pub struct ExperimentParams {
    /// Random UUID sent as `x-warp-experiment-id`
    pub id: String,
    /// Hex digest of 32 random bytes sent as `x-warp-experiment-bucket`
    pub bucket: String,
}

/// Generate a fresh experiment id + bucket pair.
pub fn generate_experiment_params() -> ExperimentParams {
    let id = Uuid::new_v4().to_string();
    let seed: [u8; 32] = rand::random();
    let bucket = hex::encode(Sha256::digest(seed));
    ExperimentParams { id, bucket }
}

/// Perform the client login handshake.
///
/// Success is HTTP 204; the session cookies land in `client`'s cookie jar.
/// 403/429 carry the account-scoped meaning from [`Error`]; other statuses
/// are plain upstream errors.
pub async fn client_login(
    client: &reqwest::Client,
    jwt: &str,
    experiment: &ExperimentParams,
) -> Result<()> {
    let response = client
        .post(LOGIN_ENDPOINT)
        .header("x-warp-client-id", CLIENT_ID)
        .header("x-warp-client-version", CLIENT_VERSION)
        .header("x-warp-os-category", OS_CATEGORY)
        .header("x-warp-os-name", OS_NAME)
        .header("x-warp-os-version", OS_VERSION)
        .header("authorization", format!("Bearer {jwt}"))
        .header("x-warp-experiment-id", experiment.id.as_str())
        .header("x-warp-experiment-bucket", experiment.bucket.as_str())
        .header("content-length", "0")
        .send()
        .await
        .map_err(Error::from_transport)?;

    let status = response.status();
    if status.as_u16() == 204 {
        debug!(experiment_id = %experiment.id, "client login succeeded");
        return Ok(());
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Err(Error::from_status(status.as_u16(), body))
}
