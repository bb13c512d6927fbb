use std::time::Duration;

use url::Url;

use crate::error::Error;
use crate::org::OrganizationAllowList;
use crate::pkce::PkceExchange;

const DEFAULT_CALLBACK_RESOURCE: &str = "callback.html";
const DEFAULT_EXPIRY_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(30 * 60);
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Portal authentication configuration.
///
/// Required fields are constructor parameters and are validated there, so a
/// misconfigured authenticator fails at startup instead of mid sign-in.
///
/// ```rust,ignore
/// use portal_auth::AuthConfig;
///
/// let config = AuthConfig::new("https://www.arcgis.com/sharing/rest", "ic6BRtzVkEpNKVjS")?
///     .with_allowed_organizations(["cityofportland"])
///     .with_organization_display_name("City of Portland");
/// ```
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthConfig {
    pub(crate) portal_base_url: Url,
    pub(crate) client_id: String,
    pub(crate) authorize_url: Url,
    pub(crate) token_url: Url,
    pub(crate) profile_url: Url,
    pub(crate) allowed_organizations: OrganizationAllowList,
    pub(crate) organization_display_name: Option<String>,
    pub(crate) callback_resource: String,
    pub(crate) scope: String,
    pub(crate) expiry_margin: Duration,
    pub(crate) default_token_lifetime: Duration,
    pub(crate) http_timeout: Duration,
}

impl AuthConfig {
    /// Create a configuration for the portal REST root and OAuth client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the portal URL is missing, unparseable or
    /// not http(s), or if the client ID is blank.
    pub fn new(portal_base_url: &str, client_id: impl Into<String>) -> Result<Self, Error> {
        let portal_base_url = portal_base_url.trim();
        if portal_base_url.is_empty() {
            return Err(Error::Config("portal base URL is required".into()));
        }
        let mut portal: Url = portal_base_url
            .parse()
            .map_err(|e| Error::Config(format!("portal base URL: {e}")))?;
        if !matches!(portal.scheme(), "http" | "https") {
            return Err(Error::Config(format!(
                "portal base URL must be http(s), got '{}'",
                portal.scheme()
            )));
        }
        portal.set_query(None);
        portal.set_fragment(None);

        let client_id = client_id.into();
        if client_id.trim().is_empty() {
            return Err(Error::Config("client ID is required".into()));
        }

        Ok(Self {
            authorize_url: endpoint(&portal, &["oauth2", "authorize"])?,
            token_url: endpoint(&portal, &["oauth2", "token"])?,
            profile_url: endpoint(&portal, &["community", "self"])?,
            portal_base_url: portal,
            client_id,
            allowed_organizations: OrganizationAllowList::default(),
            organization_display_name: None,
            callback_resource: DEFAULT_CALLBACK_RESOURCE.into(),
            scope: String::new(),
            expiry_margin: DEFAULT_EXPIRY_MARGIN,
            default_token_lifetime: DEFAULT_TOKEN_LIFETIME,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
        })
    }

    /// Create config from environment variables.
    ///
    /// # Required env vars
    /// - `PORTAL_BASE_URL`: portal REST root (e.g. `https://www.arcgis.com/sharing/rest`)
    /// - `PORTAL_CLIENT_ID`: public OAuth2 client ID
    ///
    /// # Optional env vars
    /// - `PORTAL_ALLOWED_ORGS`: comma-separated organization allow-list
    /// - `PORTAL_ORG_DISPLAY_NAME`: organization name for denial messages
    /// - `PORTAL_CALLBACK_RESOURCE`: callback page name (default `callback.html`)
    /// - `PORTAL_SCOPE`: OAuth2 scope (default empty)
    /// - `PORTAL_HTTP_TIMEOUT_SECS`: network timeout in seconds (default 30)
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required vars are missing or values are invalid.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if required keys are missing or values are invalid.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let portal = lookup("PORTAL_BASE_URL")
            .ok_or_else(|| Error::Config("PORTAL_BASE_URL is required".into()))?;
        let client_id = lookup("PORTAL_CLIENT_ID")
            .ok_or_else(|| Error::Config("PORTAL_CLIENT_ID is required".into()))?;

        let mut config = Self::new(&portal, client_id)?;

        if let Some(orgs) = lookup("PORTAL_ALLOWED_ORGS") {
            config = config.with_allowed_organizations(orgs.split(','));
        }
        if let Some(name) = lookup("PORTAL_ORG_DISPLAY_NAME") {
            config = config.with_organization_display_name(name);
        }
        if let Some(resource) = lookup("PORTAL_CALLBACK_RESOURCE") {
            config = config.with_callback_resource(resource);
        }
        if let Some(scope) = lookup("PORTAL_SCOPE") {
            config = config.with_scope(scope);
        }
        if let Some(secs) = lookup("PORTAL_HTTP_TIMEOUT_SECS") {
            let secs: u64 = secs
                .trim()
                .parse()
                .map_err(|e| Error::Config(format!("PORTAL_HTTP_TIMEOUT_SECS: {e}")))?;
            config = config.with_http_timeout(Duration::from_secs(secs));
        }

        Ok(config)
    }

    /// Restrict sign-in to these organizations (empty = unrestricted).
    #[must_use]
    pub fn with_allowed_organizations<I, T>(mut self, organizations: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        self.allowed_organizations = OrganizationAllowList::new(organizations);
        self
    }

    /// Organization name used in denial messages.
    #[must_use]
    pub fn with_organization_display_name(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.organization_display_name = (!name.trim().is_empty()).then_some(name);
        self
    }

    /// Override the callback page name (default `callback.html`).
    #[must_use]
    pub fn with_callback_resource(mut self, resource: impl Into<String>) -> Self {
        self.callback_resource = resource.into();
        self
    }

    /// Override the OAuth2 scope (default empty).
    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = scope.into();
        self
    }

    /// Override the expiry safety margin (default 60 s).
    #[must_use]
    pub fn with_expiry_margin(mut self, margin: Duration) -> Self {
        self.expiry_margin = margin;
        self
    }

    /// Lifetime assumed when the provider reports no expiry (default 30 min).
    #[must_use]
    pub fn with_default_token_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_token_lifetime = lifetime;
        self
    }

    /// Override the provider request timeout (default 30 s).
    #[must_use]
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    #[must_use]
    pub fn portal_base_url(&self) -> &Url {
        &self.portal_base_url
    }

    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Authorization endpoint (`<portal>/oauth2/authorize`).
    #[must_use]
    pub fn authorize_url(&self) -> &Url {
        &self.authorize_url
    }

    /// Token endpoint (`<portal>/oauth2/token`).
    #[must_use]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// Self-profile endpoint (`<portal>/community/self`).
    #[must_use]
    pub fn profile_url(&self) -> &Url {
        &self.profile_url
    }

    #[must_use]
    pub fn allowed_organizations(&self) -> &OrganizationAllowList {
        &self.allowed_organizations
    }

    #[must_use]
    pub fn organization_display_name(&self) -> Option<&str> {
        self.organization_display_name.as_deref()
    }

    #[must_use]
    pub fn scope(&self) -> &str {
        &self.scope
    }

    #[must_use]
    pub fn expiry_margin(&self) -> Duration {
        self.expiry_margin
    }

    #[must_use]
    pub fn default_token_lifetime(&self) -> Duration {
        self.default_token_lifetime
    }

    #[must_use]
    pub fn http_timeout(&self) -> Duration {
        self.http_timeout
    }

    /// Callback URL for a page: the page's directory plus the callback resource.
    ///
    /// The provider must have this URL registered for the client.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the callback resource does not form a valid URL.
    pub fn redirect_uri_for(&self, page: &Url) -> Result<Url, Error> {
        page.join(&self.callback_resource)
            .map_err(|e| Error::Config(format!("callback resource: {e}")))
    }

    /// Authorization request URL for a pending exchange.
    #[must_use]
    pub fn authorization_url(&self, exchange: &PkceExchange) -> Url {
        let mut url = self.authorize_url.clone();
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", exchange.redirect_uri.as_str())
            .append_pair("scope", &self.scope)
            .append_pair("state", &exchange.state)
            .append_pair("code_challenge", &exchange.code_challenge)
            .append_pair("code_challenge_method", "S256");
        url
    }
}

fn endpoint(portal: &Url, segments: &[&str]) -> Result<Url, Error> {
    let mut url = portal.clone();
    url.path_segments_mut()
        .map_err(|()| Error::Config(format!("portal base URL cannot be a base: {portal}")))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    const PORTAL: &str = "https://www.arcgis.com/sharing/rest";

    #[test]
    fn test_config_constructor_derives_endpoints() {
        let config = AuthConfig::new(PORTAL, "my-app").unwrap();

        assert_eq!(config.client_id(), "my-app");
        assert_eq!(
            config.authorize_url().as_str(),
            "https://www.arcgis.com/sharing/rest/oauth2/authorize"
        );
        assert_eq!(
            config.token_url().as_str(),
            "https://www.arcgis.com/sharing/rest/oauth2/token"
        );
        assert_eq!(
            config.profile_url().as_str(),
            "https://www.arcgis.com/sharing/rest/community/self"
        );
        assert!(!config.allowed_organizations().is_restricted());
        assert_eq!(config.expiry_margin(), Duration::from_secs(60));
    }

    #[test]
    fn test_trailing_slash_is_tolerated() {
        let config = AuthConfig::new("https://www.arcgis.com/sharing/rest/", "my-app").unwrap();
        assert_eq!(
            config.token_url().as_str(),
            "https://www.arcgis.com/sharing/rest/oauth2/token"
        );
    }

    #[test]
    fn test_missing_portal_is_config_error() {
        let err = AuthConfig::new("  ", "my-app").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_blank_client_id_is_config_error() {
        let err = AuthConfig::new(PORTAL, " ").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_non_http_portal_is_config_error() {
        let err = AuthConfig::new("mailto:gis@example.org", "my-app").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_redirect_uri_replaces_last_segment() {
        let config = AuthConfig::new(PORTAL, "my-app").unwrap();
        let page: Url = "https://gis.example.org/garage-sales/index.html?edit=1#map"
            .parse()
            .unwrap();
        assert_eq!(
            config.redirect_uri_for(&page).unwrap().as_str(),
            "https://gis.example.org/garage-sales/callback.html"
        );

        let dir: Url = "https://gis.example.org/garage-sales/".parse().unwrap();
        assert_eq!(
            config.redirect_uri_for(&dir).unwrap().as_str(),
            "https://gis.example.org/garage-sales/callback.html"
        );
    }

    #[test]
    fn test_authorization_url_contains_pkce() {
        let config = AuthConfig::new(PORTAL, "test-client").unwrap();
        let page: Url = "https://gis.example.org/app/index.html".parse().unwrap();
        let exchange =
            PkceExchange::generate(config.redirect_uri_for(&page).unwrap(), page).unwrap();
        let url = config.authorization_url(&exchange);
        let pairs: HashMap<_, _> = url.query_pairs().into_owned().collect();

        assert!(url.as_str().starts_with(PORTAL));
        assert_eq!(pairs["response_type"], "code");
        assert_eq!(pairs["client_id"], "test-client");
        assert_eq!(pairs["redirect_uri"], "https://gis.example.org/app/callback.html");
        assert_eq!(pairs["scope"], "");
        assert_eq!(pairs["state"], exchange.state);
        assert_eq!(pairs["code_challenge"], exchange.code_challenge);
        assert_eq!(pairs["code_challenge_method"], "S256");
        assert!(!url.as_str().contains(&exchange.code_verifier));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PORTAL_BASE_URL", PORTAL),
            ("PORTAL_CLIENT_ID", "ic6BRtzVkEpNKVjS"),
            ("PORTAL_ALLOWED_ORGS", "cityofportland, sanpatco"),
            ("PORTAL_ORG_DISPLAY_NAME", "City of Portland"),
            ("PORTAL_HTTP_TIMEOUT_SECS", "5"),
        ]);
        let config = AuthConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.client_id(), "ic6BRtzVkEpNKVjS");
        assert_eq!(
            config.allowed_organizations().entries(),
            &["cityofportland", "sanpatco"]
        );
        assert_eq!(config.organization_display_name(), Some("City of Portland"));
        assert_eq!(config.http_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_from_lookup_requires_client_id() {
        let err = AuthConfig::from_lookup(|k| {
            (k == "PORTAL_BASE_URL").then(|| PORTAL.to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("PORTAL_CLIENT_ID"));
    }

    #[test]
    fn test_from_lookup_rejects_bad_timeout() {
        let err = AuthConfig::from_lookup(|k| match k {
            "PORTAL_BASE_URL" => Some(PORTAL.into()),
            "PORTAL_CLIENT_ID" => Some("app".into()),
            "PORTAL_HTTP_TIMEOUT_SECS" => Some("soon".into()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
