use parking_lot::Mutex;
use serde::Deserialize;
use url::Url;

use crate::config::AuthConfig;
use crate::error::Error;
use crate::events::{AuthEvent, EventBus, EventKind, SubscriptionId};
use crate::pkce::PkceExchange;
#[cfg(feature = "portal")]
use crate::provider::PortalClient;
use crate::provider::{ApiRequest, ApiResponse, IdentityProvider, PortalProfile, TokenRequest};
use crate::session::{Session, UserInfo, now_epoch};
use crate::storage::SessionStorage;

const SESSION_KEY: &str = "garage_sale_auth_session_v1";
const PKCE_KEY: &str = "garage_sale_pkce_data_v1";

/// Outcome of [`Authenticator::begin_sign_in`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignIn {
    /// A valid session already exists; no navigation needed.
    AlreadySignedIn(UserInfo),
    /// Navigate the user agent to this authorization URL.
    Redirect(Url),
}

/// Query parameters the provider appends to the callback URL.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

impl CallbackParams {
    /// Reads the callback parameters from a redirect URL.
    #[must_use]
    pub fn from_url(url: &Url) -> Self {
        let mut params = Self::default();
        for (key, value) in url.query_pairs() {
            let slot = match key.as_ref() {
                "code" => &mut params.code,
                "state" => &mut params.state,
                "error" => &mut params.error,
                "error_description" => &mut params.error_description,
                _ => continue,
            };
            *slot = Some(value.into_owned());
        }
        params
    }
}

/// Result of a completed sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInComplete {
    pub user: UserInfo,
    /// Page the user started from.
    pub return_url: Url,
}

/// Browser-style session authenticator for an OAuth2 PKCE portal.
///
/// Sign-in is split across the redirect: [`begin_sign_in`](Self::begin_sign_in)
/// yields the URL to navigate to, and the callback page hands the provider's
/// parameters to [`complete_sign_in`](Self::complete_sign_in). Both the
/// session and the pending exchange live in the injected storage, so the two
/// halves may run in different page loads or processes.
///
/// A [`sign_out`](Self::sign_out) always wins over requests still in flight:
/// their results are dropped instead of being written back.
pub struct Authenticator<S, P> {
    config: AuthConfig,
    storage: S,
    provider: P,
    events: EventBus,
    /// Bumped by every sign-out. Session writes that follow an await hold
    /// this lock and give up if it moved.
    generation: Mutex<u64>,
}

#[cfg(feature = "portal")]
impl<S: SessionStorage> Authenticator<S, PortalClient> {
    /// Create an authenticator talking to the configured portal over HTTP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the HTTP client cannot be built.
    pub fn portal(config: AuthConfig, storage: S) -> Result<Self, Error> {
        let provider = PortalClient::new(&config)?;
        Ok(Self::new(config, storage, provider))
    }
}

impl<S: SessionStorage, P: IdentityProvider> Authenticator<S, P> {
    #[must_use]
    pub fn new(config: AuthConfig, storage: S, provider: P) -> Self {
        Self {
            config,
            storage,
            provider,
            events: EventBus::new(),
            generation: Mutex::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Subscribe to an event kind. Handlers run synchronously in
    /// registration order.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&AuthEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    // ── Queries ────────────────────────────────────────────────────────

    /// True iff a non-expired session exists and its organization passes the
    /// allow-list (when one is configured).
    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        self.signed_in_session().is_some()
    }

    /// Access token of a signed-in session; `None` otherwise, never a stale one.
    #[must_use]
    pub fn get_token(&self) -> Option<String> {
        self.signed_in_session().map(|s| s.access_token)
    }

    /// Identity of the current non-expired session.
    #[must_use]
    pub fn get_user_info(&self) -> Option<UserInfo> {
        self.live_session().map(|s| s.user_info())
    }

    // ── Sign-in ────────────────────────────────────────────────────────

    /// Start a sign-in from `current_page`.
    ///
    /// Re-announces the current identity if already signed in. Otherwise
    /// stores a fresh PKCE exchange (replacing any pending one) and returns
    /// the authorization URL to navigate to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CryptoUnavailable`] if PKCE parameters cannot be
    /// generated, [`Error::Config`] if no callback URL can be derived from the
    /// page, or [`Error::Storage`] if the exchange cannot be persisted.
    pub fn begin_sign_in(&self, current_page: &Url) -> Result<SignIn, Error> {
        if let Some(session) = self.signed_in_session() {
            let user = session.user_info();
            self.events.emit(&AuthEvent::SignedIn(user.clone()));
            return Ok(SignIn::AlreadySignedIn(user));
        }

        let prepared = self
            .config
            .redirect_uri_for(current_page)
            .and_then(|redirect_uri| PkceExchange::generate(redirect_uri, current_page.clone()))
            .and_then(|exchange| {
                self.save(PKCE_KEY, &exchange)?;
                Ok(exchange)
            });
        let exchange = match prepared {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::error!(error = %e, "Failed to prepare PKCE sign-in");
                return Err(self.fail(e));
            }
        };

        tracing::info!(redirect_uri = %exchange.redirect_uri, "Redirecting to portal sign-in");
        Ok(SignIn::Redirect(self.config.authorization_url(&exchange)))
    }

    /// Finish a sign-in from the provider's callback parameters.
    ///
    /// The pending exchange is consumed whatever the outcome. On failure no
    /// session remains, and a grant that arrives after a sign-out is dropped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StateMismatch`] if there is no pending exchange or the
    /// `state` differs, [`Error::TokenExchange`] if the provider reported an
    /// error, no code was returned, the token request failed or the user
    /// signed out meanwhile, and [`Error::Storage`] if the exchange cannot be
    /// consumed or the session cannot be saved.
    pub async fn complete_sign_in(&self, params: CallbackParams) -> Result<SignInComplete, Error> {
        let generation = *self.generation.lock();
        let result = match self.take_pending() {
            Ok(pending) => self.exchange(pending, params, generation).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(done) => {
                tracing::info!(
                    username = done.user.username.as_deref().unwrap_or_default(),
                    "Portal OAuth2 sign-in successful"
                );
                self.events.emit(&AuthEvent::SignedIn(done.user.clone()));
                Ok(done)
            }
            Err(e) => {
                self.discard_session(generation);
                Err(self.fail(e))
            }
        }
    }

    async fn exchange(
        &self,
        pending: Option<PkceExchange>,
        params: CallbackParams,
        generation: u64,
    ) -> Result<SignInComplete, Error> {
        let Some(pending) = pending else {
            tracing::warn!("OAuth callback without a pending sign-in");
            return Err(Error::StateMismatch);
        };
        if params.state.as_deref() != Some(pending.state.as_str()) {
            tracing::warn!("OAuth state mismatch");
            return Err(Error::StateMismatch);
        }

        if let Some(error) = &params.error {
            let desc = params.error_description.as_deref().unwrap_or("Unknown error");
            tracing::warn!(error = %error, description = %desc, "OAuth2 error from portal");
            return Err(Error::TokenExchange(format!("{error}: {desc}")));
        }

        let code = params
            .code
            .ok_or_else(|| Error::TokenExchange("missing authorization code".into()))?;

        let grant = self
            .provider
            .exchange_code(TokenRequest {
                client_id: self.config.client_id(),
                code: &code,
                code_verifier: &pending.code_verifier,
                redirect_uri: &pending.redirect_uri,
            })
            .await
            .inspect_err(|e| tracing::error!(error = %e, "Token exchange failed"))?;

        let session =
            Session::from_grant(grant, now_epoch(), self.config.default_token_lifetime());
        {
            let current = self.generation.lock();
            if *current != generation {
                tracing::warn!("Signed out during the token exchange, dropping the grant");
                return Err(Error::TokenExchange("sign-in was cancelled by a sign-out".into()));
            }
            self.save(SESSION_KEY, &session)?;
        }

        Ok(SignInComplete {
            user: session.user_info(),
            return_url: pending.return_url,
        })
    }

    // ── Profile ────────────────────────────────────────────────────────

    /// Fetch the user's profile and merge it into the session.
    ///
    /// This is where organization membership is validated: a profile outside
    /// the allow-list signs the user out before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSignedIn`] without a live token or if the session
    /// changed while the request was in flight, [`Error::ProfileFetch`] if the
    /// request fails, [`Error::OrganizationDenied`] if the organization is not
    /// allowed, and [`Error::Storage`] if the session cannot be updated.
    pub async fn who_am_i(&self) -> Result<PortalProfile, Error> {
        let Some(session) = self.live_session() else {
            return Err(self.fail(Error::NotSignedIn));
        };
        let token = session.access_token;

        let profile = match self.provider.fetch_profile(&token).await {
            Ok(profile) => profile,
            Err(e) => {
                tracing::error!(error = %e, "Profile request failed");
                return Err(self.fail(e));
            }
        };

        let organization = profile.organization();
        if !self.config.allowed_organizations().permits(organization) {
            tracing::warn!(
                organization = organization.unwrap_or_default(),
                "Organization not on allow-list, signing out"
            );
            if !self.end_session(Some(token.as_str()))? {
                return Err(self.fail(Error::NotSignedIn));
            }
            return Err(self.fail(Error::organization_denied(
                organization,
                self.config.organization_display_name(),
            )));
        }

        let merged = {
            let _generation = self.generation.lock();
            match self.load::<Session>(SESSION_KEY) {
                Some(mut current) if current.access_token == token => {
                    current.merge_profile(&profile);
                    self.save(SESSION_KEY, &current)
                }
                _ => {
                    tracing::warn!("Session changed during the profile request");
                    Err(Error::NotSignedIn)
                }
            }
        };
        match merged {
            Ok(()) => Ok(profile),
            Err(e) => Err(self.fail(e)),
        }
    }

    // ── Requests ───────────────────────────────────────────────────────

    /// Send a request to the portal with the session's token.
    ///
    /// A token refused by the portal (HTTP 401, or error code 498/499 in the
    /// body) ends the session. Any other reply is returned as is; use
    /// [`ApiResponse::json`] to decode it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotSignedIn`] without a signed-in session,
    /// [`Error::Request`] on transport failure, [`Error::AuthenticationExpired`]
    /// if the token was refused, and [`Error::Storage`] if that sign-out
    /// cannot be persisted.
    pub async fn authenticated_request(&self, request: &ApiRequest) -> Result<ApiResponse, Error> {
        let Some(token) = self.get_token() else {
            return Err(self.fail(Error::NotSignedIn));
        };

        let response = match self.provider.send(request, &token).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, url = %request.url, "Portal request failed");
                return Err(self.fail(e));
            }
        };

        if response.rejects_token() {
            tracing::warn!(status = response.status, url = %request.url, "Portal refused the token, signing out");
            self.end_session(Some(token.as_str()))?;
            return Err(self.fail(Error::AuthenticationExpired));
        }
        Ok(response)
    }

    // ── Sign-out ───────────────────────────────────────────────────────

    /// Drop the session and any pending exchange. Signing out twice is fine.
    ///
    /// Requests still in flight will not restore the session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if either record cannot be removed; no
    /// `SignedOut` event is emitted then.
    pub fn sign_out(&self) -> Result<(), Error> {
        self.end_session(None).map(|_| ())
    }

    /// Clears both records and emits `SignedOut`. With `token`, does nothing
    /// and returns `false` unless the stored session still carries it.
    fn end_session(&self, token: Option<&str>) -> Result<bool, Error> {
        let removed = {
            let mut generation = self.generation.lock();
            if token.is_some_and(|token| !self.holds_token(token)) {
                return Ok(false);
            }
            *generation += 1;
            let session = self.storage.remove(SESSION_KEY);
            let pending = self.storage.remove(PKCE_KEY);
            session.and(pending)
        };

        match removed {
            Ok(()) => {
                tracing::info!("Signed out");
                self.events.emit(&AuthEvent::SignedOut);
                Ok(true)
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to clear session");
                Err(self.fail(e))
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────────────

    fn fail(&self, error: Error) -> Error {
        self.events.emit(&AuthEvent::from(&error));
        error
    }

    fn live_session(&self) -> Option<Session> {
        self.load::<Session>(SESSION_KEY)
            .filter(|s| !s.is_expired(now_epoch(), self.config.expiry_margin()))
    }

    fn signed_in_session(&self) -> Option<Session> {
        self.live_session().filter(|s| {
            self.config
                .allowed_organizations()
                .permits(s.organization.as_deref())
        })
    }

    fn holds_token(&self, token: &str) -> bool {
        self.load::<Session>(SESSION_KEY)
            .is_some_and(|s| s.access_token == token)
    }

    fn take_pending(&self) -> Result<Option<PkceExchange>, Error> {
        let pending = self.load(PKCE_KEY);
        self.storage.remove(PKCE_KEY)?;
        Ok(pending)
    }

    /// Removes the session after a failed sign-in, unless a sign-out has
    /// happened since `generation` (a newer session may exist by then).
    fn discard_session(&self, generation: u64) {
        let current = self.generation.lock();
        if *current != generation {
            return;
        }
        if let Err(e) = self.storage.remove(SESSION_KEY) {
            tracing::error!(error = %e, "Failed to clear session after failed sign-in");
        }
    }

    fn load<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.storage.get(key)?;
        serde_json::from_str(&raw)
            .inspect_err(|e| tracing::warn!(error = %e, key, "Discarding unreadable stored record"))
            .ok()
    }

    fn save<T: serde::Serialize>(&self, key: &str, value: &T) -> Result<(), Error> {
        let raw = serde_json::to_string(value).map_err(|e| Error::Storage(e.to_string()))?;
        self.storage.set(key, &raw)
    }
}

impl<S, P> std::fmt::Debug for Authenticator<S, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("config", &self.config)
            .field("events", &self.events)
            .finish_non_exhaustive()
    }
}
