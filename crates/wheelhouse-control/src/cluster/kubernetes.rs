//! Kubernetes API server client.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Certificate, Client, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::ClusterConfig;
use crate::error::{ControlError, ControlResult};

use super::{ClusterApi, ComponentGroup, ConfigDocument, GroupKind};

const MERGE_PATCH: &str = "application/merge-patch+json";

/// Longest upstream error body kept in error messages.
const MAX_ERROR_BODY: usize = 512;

#[derive(Deserialize)]
struct RawConfigMap {
    metadata: RawMetadata,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMetadata {
    name: String,
    #[serde(default)]
    resource_version: Option<String>,
}

#[derive(Deserialize)]
struct RawGroupList {
    #[serde(default)]
    items: Vec<RawGroup>,
}

#[derive(Deserialize)]
struct RawGroup {
    metadata: RawMetadata,
    #[serde(default)]
    spec: RawGroupSpec,
}

#[derive(Default, Deserialize)]
struct RawGroupSpec {
    #[serde(default)]
    replicas: Option<i32>,
}

/// Client for the Kubernetes REST API.
///
/// Authenticates with the service account token mounted into the pod. The
/// token is re-read on every request because projected tokens rotate.
#[derive(Debug, Clone)]
pub struct KubernetesClient {
    client: Client,
    base_url: String,
    token_path: PathBuf,
}

impl KubernetesClient {
    /// Create a client from configuration.
    pub fn new(config: &ClusterConfig) -> ControlResult<Self> {
        let mut builder = Client::builder().timeout(Duration::from_secs(config.timeout_secs));

        match std::fs::read(&config.ca_path) {
            Ok(pem) => {
                let cert = Certificate::from_pem(&pem).map_err(|e| {
                    ControlError::Config(format!(
                        "invalid CA bundle {}: {e}",
                        config.ca_path.display()
                    ))
                })?;
                builder = builder.add_root_certificate(cert);
            }
            Err(e) => {
                warn!(
                    path = %config.ca_path.display(),
                    error = %e,
                    "cluster CA bundle unavailable, using system roots"
                );
            }
        }

        let client = builder.build().map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: config.api_url.trim_end_matches('/').to_owned(),
            token_path: config.token_path.clone(),
        })
    }

    /// Create a client against a custom base URL without a CA bundle.
    pub fn with_url(url: impl Into<String>, token_path: impl Into<PathBuf>) -> ControlResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(ControlError::Http)?;

        Ok(Self {
            client,
            base_url: url.into().trim_end_matches('/').to_owned(),
            token_path: token_path.into(),
        })
    }

    fn config_map_url(&self, name: &str, namespace: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{namespace}/configmaps/{name}",
            self.base_url
        )
    }

    fn groups_url(&self, kind: GroupKind, namespace: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{namespace}/{}",
            self.base_url,
            kind.resource()
        )
    }

    async fn bearer_token(&self) -> Option<SecretString> {
        match tokio::fs::read_to_string(&self.token_path).await {
            Ok(token) => Some(SecretString::from(token.trim().to_owned())),
            Err(e) => {
                debug!(
                    path = %self.token_path.display(),
                    error = %e,
                    "no service account token, sending unauthenticated request"
                );
                None
            }
        }
    }

    async fn send(&self, request: RequestBuilder) -> ControlResult<Response> {
        let request = match self.bearer_token().await {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request,
        };
        request.send().await.map_err(ControlError::Http)
    }
}

async fn upstream_error(context: &str, response: Response) -> ControlError {
    let status = response.status();
    let mut body = response.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    ControlError::upstream(format!("{context}: {status}: {body}"))
}

#[async_trait]
impl ClusterApi for KubernetesClient {
    async fn read_config(&self, name: &str, namespace: &str) -> ControlResult<ConfigDocument> {
        let url = self.config_map_url(name, namespace);
        let response = self.send(self.client.get(&url)).await?;

        match response.status() {
            StatusCode::OK => {
                let raw: RawConfigMap = response.json().await.map_err(ControlError::Http)?;
                Ok(ConfigDocument {
                    data: raw.data,
                    version: raw.metadata.resource_version,
                })
            }
            StatusCode::NOT_FOUND => Err(ControlError::ConfigNotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            }),
            _ => Err(upstream_error("read config map", response).await),
        }
    }

    async fn write_config(
        &self,
        name: &str,
        namespace: &str,
        document: &ConfigDocument,
    ) -> ControlResult<()> {
        let url = self.config_map_url(name, namespace);

        // A resourceVersion in the patch body makes the write conditional.
        let mut metadata = serde_json::Map::new();
        if let Some(version) = &document.version {
            metadata.insert("resourceVersion".to_owned(), json!(version));
        }
        let body = json!({
            "metadata": metadata,
            "data": document.data,
        });

        let request = self
            .client
            .patch(&url)
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body.to_string());
        let response = self.send(request).await?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(ControlError::ConfigNotFound {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
            }),
            StatusCode::CONFLICT => Err(ControlError::ManifestConflict(name.to_owned())),
            _ => Err(upstream_error("write config map", response).await),
        }
    }

    async fn list_groups(
        &self,
        kind: GroupKind,
        namespace: &str,
        label_selector: &str,
    ) -> ControlResult<Vec<ComponentGroup>> {
        let url = self.groups_url(kind, namespace);
        let request = self
            .client
            .get(&url)
            .query(&[("labelSelector", label_selector)]);
        let response = self.send(request).await?;

        if !response.status().is_success() {
            return Err(upstream_error(&format!("list {}", kind.resource()), response).await);
        }

        let list: RawGroupList = response.json().await.map_err(ControlError::Http)?;
        Ok(list
            .items
            .into_iter()
            .map(|item| ComponentGroup {
                kind,
                name: item.metadata.name,
                replicas: item.spec.replicas,
            })
            .collect())
    }

    async fn scale_group(
        &self,
        kind: GroupKind,
        name: &str,
        namespace: &str,
        replicas: i32,
    ) -> ControlResult<()> {
        let url = format!("{}/{name}/scale", self.groups_url(kind, namespace));
        let body = json!({ "spec": { "replicas": replicas } });

        let request = self
            .client
            .patch(&url)
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(body.to_string());
        let response = self.send(request).await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(upstream_error(&format!("scale {kind}/{name}"), response).await)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> KubernetesClient {
        KubernetesClient::with_url("https://cluster.local/", "/nonexistent/token").unwrap()
    }

    #[test]
    fn builds_resource_urls() {
        let client = client();
        assert_eq!(
            client.config_map_url("airflow-config-pypi", "airflow"),
            "https://cluster.local/api/v1/namespaces/airflow/configmaps/airflow-config-pypi"
        );
        assert_eq!(
            client.groups_url(GroupKind::StatefulSet, "airflow"),
            "https://cluster.local/apis/apps/v1/namespaces/airflow/statefulsets"
        );
    }

    #[test]
    fn parses_config_map() {
        let raw: RawConfigMap = serde_json::from_str(
            r#"{
                "metadata": {"name": "airflow-config-pypi", "resourceVersion": "42"},
                "data": {"requirements.txt": "pandas==2.0\nrequests"}
            }"#,
        )
        .unwrap();
        assert_eq!(raw.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(raw.data["requirements.txt"], "pandas==2.0\nrequests");
    }

    #[test]
    fn parses_group_list_with_unset_replicas() {
        let list: RawGroupList = serde_json::from_str(
            r#"{
                "items": [
                    {"metadata": {"name": "worker"}, "spec": {"replicas": 3}},
                    {"metadata": {"name": "triggerer"}, "spec": {}},
                    {"metadata": {"name": "bare"}}
                ]
            }"#,
        )
        .unwrap();
        let replicas: Vec<_> = list.items.iter().map(|i| i.spec.replicas).collect();
        assert_eq!(replicas, [Some(3), None, None]);
    }

    #[tokio::test]
    async fn missing_token_file_yields_no_credentials() {
        assert!(client().bearer_token().await.is_none());
    }
}
