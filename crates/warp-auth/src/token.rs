//! JWT refresh against the upstream token endpoint
//!
//! POSTs the standard `grant_type=refresh_token` form with the fixed client
//! version and OS headers. The endpoint fronts a Google identity service, so
//! the bearer may come back as `access_token` or `idToken` and `expires_in`
//! may be a JSON number or a string — both shapes are accepted.

use serde::{Deserialize, Deserializer};

use crate::constants::{CLIENT_VERSION, OS_CATEGORY, OS_NAME, OS_VERSION, REFRESH_ENDPOINT};
use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts this to an absolute expiry instant when storing it on the
/// account.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default, rename = "idToken")]
    pub id_token: Option<String>,
    /// A rotated refresh token, when the endpoint issues one
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default = "default_expires_in", deserialize_with = "expires_in_field")]
    pub expires_in: u64,
}

impl TokenResponse {
    /// The bearer token, whichever field the endpoint used.
    pub fn bearer(&self) -> Option<&str> {
        self.access_token
            .as_deref()
            .or(self.id_token.as_deref())
            .filter(|t| !t.is_empty())
    }
}

fn default_expires_in() -> u64 {
    3600
}

/// Accepts `"expires_in": 3600` as well as `"expires_in": "3600"`.
fn expires_in_field<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(u64),
        String(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::String(s) => Ok(s.parse().unwrap_or_else(|_| default_expires_in())),
    }
}

/// Exchange a refresh token for a fresh JWT.
///
/// On 403 the refresh token is rejected for good (`Error::Blocked`); on 429
/// the identity endpoint is rate limiting (`Error::RateLimited`); timeouts
/// and connection failures are `Error::Transient` and must not change
/// account state.
pub async fn refresh_access_token(
    client: &reqwest::Client,
    refresh_token: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(REFRESH_ENDPOINT)
        .header("x-warp-client-version", CLIENT_VERSION)
        .header("x-warp-os-category", OS_CATEGORY)
        .header("x-warp-os-name", OS_NAME)
        .header("x-warp-os-version", OS_VERSION)
        .form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ])
        .send()
        .await
        .map_err(Error::from_transport)?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::from_status(status.as_u16(), body));
    }

    let token: TokenResponse = response
        .json()
        .await
        .map_err(|e| Error::InvalidResponse(format!("token response: {e}")))?;

    if token.bearer().is_none() {
        return Err(Error::InvalidResponse(
            "token response carried neither access_token nor idToken".into(),
        ));
    }

    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_access_token_form() {
        let json = r#"{"access_token":"at_abc","refresh_token":"rt_def","expires_in":3600}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.bearer(), Some("at_abc"));
        assert_eq!(token.refresh_token.as_deref(), Some("rt_def"));
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn deserializes_id_token_form() {
        let json = r#"{"idToken":"jwt_xyz","expires_in":"3600"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.bearer(), Some("jwt_xyz"));
        assert_eq!(token.expires_in, 3600);
        assert!(token.refresh_token.is_none());
    }

    #[test]
    fn access_token_preferred_over_id_token() {
        let json = r#"{"access_token":"at","idToken":"id","expires_in":60}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.bearer(), Some("at"));
    }

    #[test]
    fn missing_expires_in_defaults_to_an_hour() {
        let json = r#"{"access_token":"at"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn unparseable_expires_in_string_defaults() {
        let json = r#"{"access_token":"at","expires_in":"soon"}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert_eq!(token.expires_in, 3600);
    }

    #[test]
    fn empty_bearer_is_none() {
        let json = r#"{"access_token":"","expires_in":10}"#;
        let token: TokenResponse = serde_json::from_str(json).unwrap();
        assert!(token.bearer().is_none());
    }
}
