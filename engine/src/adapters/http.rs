//! HTTP client shared by the REST adapters

use std::time::Duration;

use reqwest::{header, Client, Method, RequestBuilder, Response};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};

use crate::errors::ReleaseError;

/// Credentials attached to every request
#[derive(Debug)]
pub enum Auth {
    None,
    Basic { user: String, password: SecretString },
    Bearer(SecretString),
}

impl Auth {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Auth::Basic {
            user: user.into(),
            password: SecretString::from(password.into()),
        }
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Auth::Bearer(SecretString::from(token.into()))
    }
}

/// HTTP client bound to one base URL
#[derive(Debug)]
pub struct HttpClient {
    client: Client,
    base_url: String,
    auth: Auth,
}

impl HttpClient {
    /// Create a new HTTP client
    pub fn new(base_url: &str, auth: Auth) -> Result<Self, ReleaseError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self::with_client(client, base_url, auth))
    }

    /// Create a client that accepts self-signed certificates
    pub fn insecure(base_url: &str, auth: Auth) -> Result<Self, ReleaseError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .danger_accept_invalid_certs(true)
            .build()?;
        Ok(Self::with_client(client, base_url, auth))
    }

    pub fn with_client(client: Client, base_url: &str, auth: Auth) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);
        let request = self.client.request(method, url);
        match &self.auth {
            Auth::None => request,
            Auth::Basic { user, password } => {
                request.basic_auth(user, Some(password.expose_secret()))
            }
            Auth::Bearer(token) => request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            ),
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, ReleaseError> {
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let url = response.url().to_string();
            let body = response.text().await.unwrap_or_default();
            if status.as_u16() != 404 {
                error!("HTTP request to {} failed: {} - {}", url, status, body);
            }
            return Err(ReleaseError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// GET and decode JSON
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ReleaseError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        Ok(response.json().await?)
    }

    /// GET and decode JSON, `None` on 404
    pub async fn get_json_opt<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> Result<Option<T>, ReleaseError> {
        match self.get_json(path).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET as text, `None` on 404
    pub async fn get_text_opt(&self, path: &str) -> Result<Option<String>, ReleaseError> {
        match self.send(self.request(Method::GET, path)).await {
            Ok(response) => Ok(Some(response.text().await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET as text
    pub async fn get_text(&self, path: &str) -> Result<String, ReleaseError> {
        let response = self.send(self.request(Method::GET, path)).await?;
        Ok(response.text().await?)
    }

    /// POST a JSON body, ignoring the response body
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, ReleaseError> {
        self.send(self.request(Method::POST, path).json(body)).await
    }

    /// POST form parameters
    pub async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<Response, ReleaseError> {
        self.send(self.request(Method::POST, path).form(form)).await
    }

    /// POST a raw body with the given content type
    pub async fn post_raw(
        &self,
        path: &str,
        content_type: &str,
        body: String,
    ) -> Result<Response, ReleaseError> {
        self.send(
            self.request(Method::POST, path)
                .header(header::CONTENT_TYPE, content_type)
                .body(body),
        )
        .await
    }

    /// PUT a JSON body
    pub async fn put_json<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, ReleaseError> {
        self.send(self.request(Method::PUT, path).json(body)).await
    }

    /// PATCH with a JSON merge patch
    pub async fn merge_patch<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Response, ReleaseError> {
        let body = serde_json::to_string(body)?;
        self.send(
            self.request(Method::PATCH, path)
                .header(header::CONTENT_TYPE, "application/merge-patch+json")
                .body(body),
        )
        .await
    }
}
