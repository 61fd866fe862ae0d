//! Image registry adapter

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::info;
use url::Url;

use crate::adapters::http::{Auth, HttpClient};
use crate::errors::ReleaseError;

/// Registry operations used by image sync and pull secrets
#[async_trait]
pub trait ImageRegistry: Send + Sync {
    /// Registry host used in image references, e.g. `harbor.local:5000`
    fn host(&self) -> String;

    /// Whether `project/repository:tag` exists
    async fn tag_exists(&self, project: &str, repository: &str, tag: &str)
        -> Result<bool, ReleaseError>;

    /// Copy `from_project/repository:tag` into `to_project/repository`
    async fn copy_tag(
        &self,
        from_project: &str,
        to_project: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), ReleaseError>;

    /// `.dockerconfigjson` content granting pull access
    fn docker_config(&self) -> serde_json::Value;
}

/// Harbor v2 client
pub struct HarborClient {
    http: HttpClient,
    host: String,
    user: String,
    password: SecretString,
}

impl HarborClient {
    pub fn new(base_url: &str, user: &str, password: &str) -> Result<Self, ReleaseError> {
        let url = Url::parse(base_url)
            .map_err(|e| ReleaseError::ConfigInvalid(format!("registry url {}: {}", base_url, e)))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ReleaseError::ConfigInvalid(format!(
                    "registry url {} has no host",
                    base_url
                )))
            }
        };
        Ok(Self {
            http: HttpClient::new(base_url, Auth::basic(user, password))?,
            host,
            user: user.to_string(),
            password: SecretString::from(password.to_string()),
        })
    }

    fn encode_repository(repository: &str) -> String {
        // nested repositories are double-encoded by the v2 API
        repository.replace('/', "%252F")
    }
}

#[async_trait]
impl ImageRegistry for HarborClient {
    fn host(&self) -> String {
        self.host.clone()
    }

    async fn tag_exists(
        &self,
        project: &str,
        repository: &str,
        tag: &str,
    ) -> Result<bool, ReleaseError> {
        let path = format!(
            "/api/v2.0/projects/{}/repositories/{}/artifacts/{}",
            project,
            Self::encode_repository(repository),
            tag
        );
        let found: Option<serde_json::Value> = self.http.get_json_opt(&path).await?;
        Ok(found.is_some())
    }

    async fn copy_tag(
        &self,
        from_project: &str,
        to_project: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), ReleaseError> {
        info!(
            "Copying {}/{}:{} to project {} on {}",
            from_project, repository, tag, to_project, self.host
        );
        let from: String = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("from", &format!("{}/{}:{}", from_project, repository, tag))
            .finish();
        let path = format!(
            "/api/v2.0/projects/{}/repositories/{}/artifacts?{}",
            to_project,
            Self::encode_repository(repository),
            from
        );
        self.http
            .post_json(&path, &json!({}))
            .await
            .map_err(|e| ReleaseError::Registry(e.to_string()))?;
        Ok(())
    }

    fn docker_config(&self) -> serde_json::Value {
        docker_config_json(&self.host, &self.user, self.password.expose_secret())
    }
}

/// Build a `.dockerconfigjson` document for one registry
pub fn docker_config_json(host: &str, user: &str, password: &str) -> serde_json::Value {
    let auth = STANDARD.encode(format!("{}:{}", user, password));
    json!({
        "auths": {
            host: {
                "username": user,
                "password": password,
                "auth": auth,
            }
        }
    })
}
