use std::fmt;
use std::future::Future;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

#[cfg(feature = "portal")]
use crate::config::AuthConfig;
use crate::error::Error;

/// Code-for-token request sent to the provider's token endpoint.
///
/// This is the only place the code verifier leaves the client.
#[derive(Debug, Clone, Copy)]
pub struct TokenRequest<'a> {
    pub client_id: &'a str,
    pub code: &'a str,
    pub code_verifier: &'a str,
    pub redirect_uri: &'a Url,
}

/// Token response from the provider's token endpoint.
#[derive(Debug, Clone, Deserialize)]
#[non_exhaustive]
pub struct TokenGrant {
    pub access_token: String,
    /// Lifetime in seconds.
    #[serde(default)]
    pub expires_in: Option<i64>,
    /// Absolute expiry in epoch seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
}

impl TokenGrant {
    #[must_use]
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            expires_in: None,
            expires_at: None,
            username: None,
        }
    }

    #[must_use]
    pub fn with_expires_in(mut self, seconds: i64) -> Self {
        self.expires_in = Some(seconds);
        self
    }

    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }
}

/// Self-profile from the portal's `community/self` endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[non_exhaustive]
pub struct PortalProfile {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
    #[serde(default)]
    pub portal_url: Option<String>,
    #[serde(default)]
    pub url_key: Option<String>,
}

impl PortalProfile {
    /// Organization identifier checked against the allow-list: the portal
    /// host if reported, else the organization URL key.
    #[must_use]
    pub fn organization(&self) -> Option<&str> {
        self.portal_url.as_deref().or(self.url_key.as_deref())
    }
}

/// HTTP method of an [`ApiRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiMethod {
    Get,
    Post,
}

/// Call to a portal REST resource made on behalf of the signed-in user.
///
/// `f=json` and the bearer token are added when the request is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiRequest {
    pub method: ApiMethod,
    pub url: Url,
    pub params: Vec<(String, String)>,
}

impl ApiRequest {
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self {
            method: ApiMethod::Get,
            url,
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn post(url: Url) -> Self {
        Self {
            method: ApiMethod::Post,
            url,
            params: Vec::new(),
        }
    }

    /// Adds a query (GET) or form (POST) parameter.
    #[must_use]
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// Status and body of an authenticated portal call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: String,
}

impl ApiResponse {
    #[must_use]
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// True if the portal refused the access token: HTTP 401, or an error
    /// object with code 498 (invalid token) or 499 (token required), which
    /// the portal usually sends with HTTP 200.
    #[must_use]
    pub fn rejects_token(&self) -> bool {
        self.status == 401
            || matches!(
                serde_json::from_str::<FaultReply>(&self.body),
                Ok(FaultReply {
                    error: Fault::Detailed {
                        code: Some(498 | 499),
                        ..
                    },
                    ..
                })
            )
    }

    /// Decodes a successful JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Request`] for a non-2xx status, an embedded error
    /// object, or a body that does not decode as `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        if !(200..300).contains(&self.status) {
            let detail = serde_json::from_str::<FaultReply>(&self.body)
                .map(|fault| fault.to_string())
                .unwrap_or_else(|_| self.body.clone());
            return Err(Error::Request(format!("HTTP {}: {detail}", self.status)));
        }
        parse_reply(&self.body).map_err(Error::Request)
    }
}

/// Network boundary to the identity provider.
pub trait IdentityProvider: Send + Sync {
    /// Exchange an authorization code and verifier for an access token.
    ///
    /// Failures must be reported as [`Error::TokenExchange`].
    fn exchange_code(
        &self,
        request: TokenRequest<'_>,
    ) -> impl Future<Output = Result<TokenGrant, Error>> + Send;

    /// Fetch the signed-in user's profile.
    ///
    /// Failures must be reported as [`Error::ProfileFetch`].
    fn fetch_profile(
        &self,
        access_token: &str,
    ) -> impl Future<Output = Result<PortalProfile, Error>> + Send;

    /// Send an authenticated request and return the reply whatever its status.
    ///
    /// Only transport failures are errors, reported as [`Error::Request`].
    fn send(
        &self,
        request: &ApiRequest,
        access_token: &str,
    ) -> impl Future<Output = Result<ApiResponse, Error>> + Send;
}

/// JSON error object returned by the portal, often with HTTP 200.
#[derive(Debug, Deserialize)]
struct FaultReply {
    error: Fault,
    #[serde(default)]
    error_description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Fault {
    /// `{"error": {"code": 498, "message": "Invalid token."}}`
    Detailed {
        #[serde(default)]
        code: Option<i64>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        error_description: Option<String>,
    },
    /// `{"error": "invalid_grant", "error_description": "..."}`
    Code(String),
}

impl fmt::Display for FaultReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error {
            Fault::Detailed {
                code,
                message,
                error_description,
            } => {
                let text = message
                    .as_deref()
                    .or(error_description.as_deref())
                    .or(self.error_description.as_deref())
                    .unwrap_or("unknown error");
                match code {
                    Some(code) => write!(f, "{text} (code {code})"),
                    None => f.write_str(text),
                }
            }
            Fault::Code(code) => match &self.error_description {
                Some(desc) => write!(f, "{code}: {desc}"),
                None => f.write_str(code),
            },
        }
    }
}

/// Decodes a provider reply, turning an embedded error object into `Err`.
fn parse_reply<T: DeserializeOwned>(body: &str) -> Result<T, String> {
    if let Ok(fault) = serde_json::from_str::<FaultReply>(body) {
        return Err(fault.to_string());
    }
    serde_json::from_str(body).map_err(|e| format!("unexpected response: {e}"))
}

/// `reqwest` client for a portal's OAuth2 and community endpoints.
#[cfg(feature = "portal")]
pub struct PortalClient {
    token_url: Url,
    profile_url: Url,
    http: reqwest::Client,
}

#[cfg(feature = "portal")]
impl PortalClient {
    /// Create a client for the configured portal with its request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn new(config: &AuthConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .timeout(config.http_timeout())
            .build()
            .map_err(|e| Error::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            token_url: config.token_url().clone(),
            profile_url: config.profile_url().clone(),
            http,
        })
    }

    /// Use a custom HTTP client (for connection pool reuse or testing).
    #[must_use]
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    /// Sends a request and decodes the body, folding transport errors, HTTP
    /// status failures and embedded error objects into one message.
    async fn read_reply<T: DeserializeOwned>(
        request: reqwest::RequestBuilder,
        operation: &'static str,
    ) -> Result<T, String> {
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        let body = response.text().await.map_err(|e| e.to_string())?;
        if !status.is_success() {
            let detail = serde_json::from_str::<FaultReply>(&body)
                .map(|fault| fault.to_string())
                .unwrap_or(body);
            return Err(format!("{operation} returned HTTP {}: {detail}", status.as_u16()));
        }
        parse_reply(&body)
    }
}

#[cfg(feature = "portal")]
impl IdentityProvider for PortalClient {
    async fn exchange_code(&self, request: TokenRequest<'_>) -> Result<TokenGrant, Error> {
        let params = [
            ("grant_type", "authorization_code"),
            ("client_id", request.client_id),
            ("code", request.code),
            ("redirect_uri", request.redirect_uri.as_str()),
            ("code_verifier", request.code_verifier),
        ];

        let http = self.http.post(self.token_url.clone()).form(&params);
        Self::read_reply(http, "token exchange")
            .await
            .map_err(Error::TokenExchange)
    }

    async fn fetch_profile(&self, access_token: &str) -> Result<PortalProfile, Error> {
        let http = self
            .http
            .get(self.profile_url.clone())
            .query(&[("f", "json")])
            .bearer_auth(access_token);
        Self::read_reply(http, "profile request")
            .await
            .map_err(Error::ProfileFetch)
    }

    async fn send(&self, request: &ApiRequest, access_token: &str) -> Result<ApiResponse, Error> {
        let mut params = vec![("f", "json")];
        params.extend(request.params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

        let http = match request.method {
            ApiMethod::Get => self.http.get(request.url.clone()).query(&params),
            ApiMethod::Post => self.http.post(request.url.clone()).form(&params),
        };
        let response = http
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        Ok(ApiResponse { status, body })
    }
}
