// SPDX-FileCopyrightText: 2025 Timothy Pogue
//
// SPDX-License-Identifier: ISC

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use cap_operator_common::telemetry::{debug, info};

use crate::crd::v1alpha1::deployable::SsoConnection;
use crate::error::{ControllerError, Result};

#[cfg(test)]
use mockall::automock;

const ADMIN_REALM: &str = "master";
const ADMIN_CLIENT_ID: &str = "admin-cli";

/// Administrator credentials of an identity provider
#[derive(Debug, Clone, PartialEq)]
pub struct AdminCredentials {
    pub username: String,
    pub password: String,
}

/// An OAuth2 client registered with the identity provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcClient {
    pub client_id: String,
    pub public_client: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_url: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
    #[serde(default)]
    pub web_origins: Vec<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Authenticate as administrator, the session is reused for every client of a deployable
    async fn login(&self, connection: &SsoConnection, credentials: &AdminCredentials) -> Result<Box<dyn IdentitySession>>;
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentitySession: Send + Sync {
    /// Create or update a client in `realm`, returning its secret when it is confidential
    async fn ensure_client(&self, realm: &str, client: &OidcClient) -> Result<Option<String>>;
}

/// Identity provider speaking the Keycloak admin REST API
#[derive(Clone, Default)]
pub struct KeycloakIdentityProvider {
    http: reqwest::Client,
}

impl KeycloakIdentityProvider {
    pub fn new() -> Self {
        Self { http: reqwest::Client::new() }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct ClientSummary {
    id: String,
}

#[derive(Deserialize)]
struct ClientSecret {
    value: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClientRepresentation<'a> {
    #[serde(flatten)]
    client: &'a OidcClient,
    enabled: bool,
    protocol: &'static str,
    standard_flow_enabled: bool,
}

#[async_trait]
impl IdentityProvider for KeycloakIdentityProvider {
    async fn login(&self, connection: &SsoConnection, credentials: &AdminCredentials) -> Result<Box<dyn IdentitySession>> {
        let base_url = connection.base_url.trim_end_matches('/').to_string();
        debug!(event = "IdentityProviderLogin", url = base_url.as_str());

        let response = self.http
            .post(format!("{}/realms/{}/protocol/openid-connect/token", base_url, ADMIN_REALM))
            .form(&[
                ("grant_type", "password"),
                ("client_id", ADMIN_CLIENT_ID),
                ("username", credentials.username.as_str()),
                ("password", credentials.password.as_str()),
            ])
            .send()
            .await?;
        let token: TokenResponse = checked(response, "login").await?.json().await?;

        Ok(Box::new(KeycloakSession { http: self.http.clone(), base_url, token: token.access_token }))
    }
}

struct KeycloakSession {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl KeycloakSession {
    fn clients_url(&self, realm: &str) -> String {
        format!("{}/admin/realms/{}/clients", self.base_url, realm)
    }

    async fn find(&self, realm: &str, client_id: &str) -> Result<Option<String>> {
        let response = self.http
            .get(self.clients_url(realm))
            .bearer_auth(&self.token)
            .query(&[("clientId", client_id)])
            .send()
            .await?;
        let clients: Vec<ClientSummary> = checked(response, "client lookup").await?.json().await?;

        Ok(clients.into_iter().next().map(|client| client.id))
    }
}

#[async_trait]
impl IdentitySession for KeycloakSession {
    async fn ensure_client(&self, realm: &str, client: &OidcClient) -> Result<Option<String>> {
        let representation = ClientRepresentation {
            client,
            enabled: true,
            protocol: "openid-connect",
            standard_flow_enabled: true,
        };

        let id = match self.find(realm, &client.client_id).await? {
            Some(id) => {
                let response = self.http
                    .put(format!("{}/{}", self.clients_url(realm), id))
                    .bearer_auth(&self.token)
                    .json(&representation)
                    .send()
                    .await?;
                checked(response, "client update").await?;
                id
            },
            None => {
                info!(event = "CreatingOidcClient", realm = realm, client = client.client_id.as_str());
                let response = self.http
                    .post(self.clients_url(realm))
                    .bearer_auth(&self.token)
                    .json(&representation)
                    .send()
                    .await?;
                checked(response, "client creation").await?;
                self.find(realm, &client.client_id).await?.ok_or_else(|| {
                    ControllerError::IdentityProviderError(format!("client {} was created but cannot be found", client.client_id))
                })?
            },
        };

        if client.public_client {
            return Ok(None);
        }

        let response = self.http
            .get(format!("{}/{}/client-secret", self.clients_url(realm), id))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let secret: ClientSecret = checked(response, "client secret").await?.json().await?;
        Ok(secret.value)
    }
}

async fn checked(response: reqwest::Response, operation: &str) -> Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(ControllerError::IdentityProviderError(format!("{} failed with {}: {}", operation, status, body)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_representation_is_camel_case() {
        let client = OidcClient {
            client_id: "shop-web".to_string(),
            public_client: false,
            root_url: Some("https://shop.example.com".to_string()),
            redirect_uris: vec!["https://shop.example.com/*".to_string()],
            web_origins: vec!["https://shop.example.com".to_string()],
        };
        let representation = ClientRepresentation {
            client: &client,
            enabled: true,
            protocol: "openid-connect",
            standard_flow_enabled: true,
        };

        assert_eq!(serde_json::to_value(&representation).unwrap(), json!({
            "clientId": "shop-web",
            "publicClient": false,
            "rootUrl": "https://shop.example.com",
            "redirectUris": ["https://shop.example.com/*"],
            "webOrigins": ["https://shop.example.com"],
            "enabled": true,
            "protocol": "openid-connect",
            "standardFlowEnabled": true,
        }));
    }
}
