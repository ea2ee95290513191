//! HTTP client for the Streamline admin API.
//!
//! Implements [`BrokerAdmin`] against the broker's REST endpoints:
//!
//! | Call | Route |
//! |---|---|
//! | describe / alter quotas | `GET` / `PATCH /api/v1/principals/{p}/quotas` |
//! | describe ACLs | `GET /api/v1/principals/{p}/acls` |
//! | create / delete ACLs | `POST /api/v1/acls`, `POST /api/v1/acls/delete` |
//! | SCRAM credentials | `GET` / `PUT` / `DELETE /api/v1/principals/{p}/scram` |

use super::{AclBinding, BrokerAdmin, QuotaChange, QuotaKey, QuotaSet, SCRAM_MECHANISM};
use crate::error::{OperatorError, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for the HTTP broker admin client.
#[derive(Debug, Clone)]
pub struct HttpBrokerAdminConfig {
    /// Base URL of the Streamline HTTP API
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout: Duration,
}

impl HttpBrokerAdminConfig {
    /// Endpoint of the first broker of a cluster's headless service
    pub fn for_cluster(cluster_name: &str, namespace: &str, http_port: u16) -> Self {
        Self {
            base_url: format!(
                "http://{}-0.{}-headless.{}.svc:{}",
                cluster_name, cluster_name, namespace, http_port
            ),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QuotasResponse {
    #[serde(default)]
    quotas: BTreeMap<String, f64>,
}

#[derive(Debug, Serialize)]
struct AlterQuotasRequest<'a> {
    changes: &'a [QuotaChange],
}

#[derive(Debug, Serialize, Deserialize)]
struct AclsPayload<T> {
    acls: T,
}

#[derive(Debug, Deserialize)]
struct ScramResponse {
    #[serde(default)]
    mechanisms: Vec<String>,
}

#[derive(Debug, Serialize)]
struct UpsertScramRequest<'a> {
    mechanism: &'a str,
    iterations: u32,
    password: &'a str,
}

/// [`BrokerAdmin`] backed by the Streamline HTTP API.
pub struct HttpBrokerAdmin {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpBrokerAdmin {
    pub fn new(config: HttpBrokerAdminConfig) -> Result<Self> {
        let base_url = Url::parse(&config.base_url).map_err(|e| {
            OperatorError::Configuration(format!(
                "invalid broker admin URL {}: {}",
                config.base_url, e
            ))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(OperatorError::Configuration(format!(
                "broker admin URL {} cannot be used as a base",
                config.base_url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| OperatorError::Configuration(format!("HTTP client: {}", e)))?;
        Ok(Self { client, base_url })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(["api", "v1"]).extend(segments);
        }
        url
    }

    fn principal_endpoint(&self, principal: &str, resource: &str) -> Url {
        self.endpoint(&["principals", principal, resource])
    }
}

fn transport_error(operation: &str, err: reqwest::Error) -> OperatorError {
    // Connection failures and timeouts are worth retrying, a broken request body is not
    let transient = !err.is_builder() && !err.is_decode();
    OperatorError::broker(format!("{}: {}", operation, err), transient)
}

/// Map a non-success response to a broker error; 5xx, 408 and 429 are transient.
async fn check(operation: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let transient = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    if !transient {
        warn!(operation, %status, "Broker rejected request");
    }
    Err(OperatorError::broker(
        format!("{}: HTTP {}: {}", operation, status, body),
        transient,
    ))
}

#[async_trait]
impl BrokerAdmin for HttpBrokerAdmin {
    async fn describe_quotas(&self, principal: &str) -> Result<QuotaSet> {
        let url = self.principal_endpoint(principal, "quotas");
        debug!(%url, "Describing quotas");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error("describe_quotas", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(QuotaSet::new());
        }
        let body: QuotasResponse = check("describe_quotas", response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error("describe_quotas", e))?;

        Ok(body
            .quotas
            .into_iter()
            .filter_map(|(key, value)| QuotaKey::parse(&key).map(|key| (key, value)))
            .collect())
    }

    async fn alter_quotas(&self, principal: &str, changes: &[QuotaChange]) -> Result<()> {
        let url = self.principal_endpoint(principal, "quotas");
        let response = self
            .client
            .patch(url)
            .json(&AlterQuotasRequest { changes })
            .send()
            .await
            .map_err(|e| transport_error("alter_quotas", e))?;
        check("alter_quotas", response).await?;
        Ok(())
    }

    async fn describe_acls(&self, principal: &str) -> Result<Vec<AclBinding>> {
        let url = self.principal_endpoint(principal, "acls");
        debug!(%url, "Describing ACLs");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error("describe_acls", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: AclsPayload<Vec<AclBinding>> = check("describe_acls", response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error("describe_acls", e))?;
        Ok(body.acls)
    }

    async fn create_acls(&self, bindings: &[AclBinding]) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&["acls"]))
            .json(&AclsPayload { acls: bindings })
            .send()
            .await
            .map_err(|e| transport_error("create_acls", e))?;
        check("create_acls", response).await?;
        Ok(())
    }

    async fn delete_acls(&self, bindings: &[AclBinding]) -> Result<()> {
        let response = self
            .client
            .post(self.endpoint(&["acls", "delete"]))
            .json(&AclsPayload { acls: bindings })
            .send()
            .await
            .map_err(|e| transport_error("delete_acls", e))?;
        check("delete_acls", response).await?;
        Ok(())
    }

    async fn scram_mechanisms(&self, principal: &str) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.principal_endpoint(principal, "scram"))
            .send()
            .await
            .map_err(|e| transport_error("describe_scram", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        let body: ScramResponse = check("describe_scram", response)
            .await?
            .json()
            .await
            .map_err(|e| transport_error("describe_scram", e))?;
        Ok(body.mechanisms)
    }

    async fn upsert_scram_credential(
        &self,
        principal: &str,
        password: &str,
        iterations: u32,
    ) -> Result<()> {
        let response = self
            .client
            .put(self.principal_endpoint(principal, "scram"))
            .json(&UpsertScramRequest {
                mechanism: SCRAM_MECHANISM,
                iterations,
                password,
            })
            .send()
            .await
            .map_err(|e| transport_error("upsert_scram_credential", e))?;
        check("upsert_scram_credential", response).await?;
        Ok(())
    }

    async fn delete_scram_credential(&self, principal: &str) -> Result<()> {
        let mut url = self.principal_endpoint(principal, "scram");
        url.query_pairs_mut().append_pair("mechanism", SCRAM_MECHANISM);
        let response = self
            .client
            .delete(url)
            .send()
            .await
            .map_err(|e| transport_error("delete_scram_credential", e))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check("delete_scram_credential", response).await?;
        Ok(())
    }
}
