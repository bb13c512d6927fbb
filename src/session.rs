use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::provider::{PortalProfile, TokenGrant};

/// Current time in epoch seconds.
pub(crate) fn now_epoch() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

/// Persisted authentication record.
///
/// Owned by the [`Authenticator`](crate::Authenticator); callers only see the
/// derived [`UserInfo`] and token accessors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub access_token: String,
    /// Absolute expiry in epoch seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub org_id: Option<String>,
}

impl Session {
    /// Builds a session from a token grant.
    ///
    /// Expiry comes from `expires_at`, else `now + expires_in`, else
    /// `now + fallback_lifetime`; a freshly created session always expires.
    #[must_use]
    pub fn from_grant(grant: TokenGrant, now: i64, fallback_lifetime: Duration) -> Self {
        let expires_at = grant
            .expires_at
            .or_else(|| grant.expires_in.map(|s| now.saturating_add(s)))
            .unwrap_or_else(|| now.saturating_add(secs(fallback_lifetime)));

        Self {
            access_token: grant.access_token,
            expires_at: Some(expires_at),
            user_id: grant.username.clone(),
            username: grant.username,
            full_name: None,
            organization: None,
            org_id: None,
        }
    }

    /// Whether the token is unusable at `now`.
    ///
    /// Tokens within `margin` of expiry count as expired, and so does a
    /// record with no expiry at all.
    #[must_use]
    pub fn is_expired(&self, now: i64, margin: Duration) -> bool {
        if self.access_token.is_empty() {
            return true;
        }
        match self.expires_at {
            Some(at) => at.saturating_sub(now) < secs(margin),
            None => true,
        }
    }

    /// Refreshes identity fields from a self-profile response.
    pub fn merge_profile(&mut self, profile: &PortalProfile) {
        if let Some(username) = &profile.username {
            self.username = Some(username.clone());
            self.user_id = Some(username.clone());
        }
        if profile.full_name.is_some() {
            self.full_name = profile.full_name.clone();
        }
        self.organization = profile.organization().map(str::to_owned);
        self.org_id = profile.org_id.clone();
    }

    #[must_use]
    pub fn user_info(&self) -> UserInfo {
        UserInfo {
            username: self.username.clone(),
            user_id: self.user_id.clone(),
            full_name: self.full_name.clone(),
            organization: self.organization.clone(),
            org_id: self.org_id.clone(),
        }
    }
}

/// Identity of the signed-in user, as exposed to the UI layer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub username: Option<String>,
    pub user_id: Option<String>,
    pub full_name: Option<String>,
    pub organization: Option<String>,
    pub org_id: Option<String>,
}

impl UserInfo {
    /// Best label for display: full name, then username.
    #[must_use]
    pub fn display_name(&self) -> Option<&str> {
        self.full_name.as_deref().or(self.username.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MARGIN: Duration = Duration::from_secs(60);
    const NOW: i64 = 1_760_000_000;

    fn grant(expires_in: Option<i64>, expires_at: Option<i64>) -> TokenGrant {
        TokenGrant {
            access_token: "tok".into(),
            expires_in,
            expires_at,
            username: Some("jdoe_portland".into()),
        }
    }

    #[test]
    fn expiry_from_expires_in() {
        let session = Session::from_grant(grant(Some(1800), None), NOW, MARGIN);
        assert_eq!(session.expires_at, Some(NOW + 1800));
        assert_eq!(session.username.as_deref(), Some("jdoe_portland"));
        assert_eq!(session.user_id.as_deref(), Some("jdoe_portland"));
    }

    #[test]
    fn absolute_expiry_wins() {
        let session = Session::from_grant(grant(Some(1800), Some(NOW + 10)), NOW, MARGIN);
        assert_eq!(session.expires_at, Some(NOW + 10));
    }

    #[test]
    fn missing_expiry_uses_fallback_lifetime() {
        let session =
            Session::from_grant(grant(None, None), NOW, Duration::from_secs(30 * 60));
        assert_eq!(session.expires_at, Some(NOW + 1800));
    }

    #[test]
    fn within_margin_is_expired() {
        let session = Session::from_grant(grant(Some(30), None), NOW, MARGIN);
        assert!(session.is_expired(NOW, MARGIN));

        let session = Session::from_grant(grant(Some(60), None), NOW, MARGIN);
        assert!(!session.is_expired(NOW, MARGIN));
        assert!(session.is_expired(NOW + 1, MARGIN));
    }

    #[test]
    fn no_expiry_or_empty_token_is_expired() {
        let mut session = Session::from_grant(grant(Some(3600), None), NOW, MARGIN);
        session.expires_at = None;
        assert!(session.is_expired(NOW, MARGIN));

        let mut session = Session::from_grant(grant(Some(3600), None), NOW, MARGIN);
        session.access_token.clear();
        assert!(session.is_expired(NOW, MARGIN));
    }

    #[test]
    fn merge_profile_refreshes_identity() {
        let mut session = Session::from_grant(grant(Some(3600), None), NOW, MARGIN);
        let profile: PortalProfile = serde_json::from_str(
            r#"{"username":"jdoe_portland","fullName":"Jane Doe",
                "orgId":"DAf01WuIltSLujAv","urlKey":"cityofportland",
                "portalUrl":"cityofportland.maps.arcgis.com"}"#,
        )
        .unwrap();
        session.merge_profile(&profile);

        let info = session.user_info();
        assert_eq!(info.full_name.as_deref(), Some("Jane Doe"));
        assert_eq!(info.organization.as_deref(), Some("cityofportland.maps.arcgis.com"));
        assert_eq!(info.org_id.as_deref(), Some("DAf01WuIltSLujAv"));
        assert_eq!(info.display_name(), Some("Jane Doe"));
    }

    #[test]
    fn stored_record_uses_camel_case() {
        let session = Session::from_grant(grant(Some(3600), None), NOW, MARGIN);
        let json = serde_json::to_value(&session).unwrap();
        assert_eq!(json["accessToken"], "tok");
        assert_eq!(json["expiresAt"], NOW + 3600);

        let legacy: Session = serde_json::from_str(r#"{"accessToken":"old"}"#).unwrap();
        assert_eq!(legacy.expires_at, None);
    }
}
