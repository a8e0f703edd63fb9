//! Request-limit info query
//!
//! Optional GraphQL lookup of the account's request quota, used after login
//! when `WARP_SHOW_LOGIN_INFO` is enabled and by the quota-aware selection
//! strategy to seed limit/used counters.

use serde::Deserialize;
use serde_json::json;

use crate::constants::{CLIENT_ID, CLIENT_VERSION, GRAPHQL_ENDPOINT, OS_CATEGORY, OS_NAME, OS_VERSION};
use crate::error::{Error, Result};

const REQUEST_LIMIT_QUERY: &str = r#"
query GetRequestLimitInfo($requestContext: RequestContext!) {
    user(requestContext: $requestContext) {
        __typename
        ... on UserOutput {
            user {
                requestLimitInfo {
                    isUnlimited
                    nextRefreshTime
                    requestLimit
                    requestsUsedSinceLastRefresh
                    requestLimitRefreshDuration
                }
            }
        }
    }
}
"#;

/// Quota snapshot for one account.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLimitInfo {
    #[serde(default)]
    pub is_unlimited: bool,
    #[serde(default)]
    pub request_limit: u64,
    #[serde(default)]
    pub requests_used_since_last_refresh: u64,
    #[serde(default)]
    pub next_refresh_time: Option<String>,
}

/// Fetch the request-limit info for the bearer's account.
pub async fn fetch_request_limits(
    client: &reqwest::Client,
    jwt: &str,
) -> Result<RequestLimitInfo> {
    let variables = json!({
        "requestContext": {
            "clientContext": { "version": CLIENT_VERSION },
            "osContext": {
                "category": OS_CATEGORY,
                "linuxKernelVersion": null,
                "name": OS_NAME,
                "version": OS_VERSION
            }
        }
    });

    let response = client
        .post(format!("{GRAPHQL_ENDPOINT}?op=GetRequestLimitInfo"))
        .header("x-warp-client-id", CLIENT_ID)
        .header("x-warp-client-version", CLIENT_VERSION)
        .header("x-warp-os-category", OS_CATEGORY)
        .header("x-warp-os-name", OS_NAME)
        .header("x-warp-os-version", OS_VERSION)
        .header("authorization", format!("Bearer {jwt}"))
        .json(&json!({
            "query": REQUEST_LIMIT_QUERY,
            "variables": variables,
            "operationName": "GetRequestLimitInfo"
        }))
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

    let body: serde_json::Value = response
        .json()
        .await
        .map_err(|e| Error::InvalidResponse(format!("usage response: {e}")))?;

    let info = body
        .pointer("/data/user/user/requestLimitInfo")
        .cloned()
        .ok_or_else(|| Error::InvalidResponse("requestLimitInfo missing from reply".into()))?;

    serde_json::from_value(info)
        .map_err(|e| Error::InvalidResponse(format!("requestLimitInfo shape: {e}")))
}
