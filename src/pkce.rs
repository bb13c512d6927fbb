use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::TryRngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::Error;

fn random_b64<const N: usize, R: TryRngCore + ?Sized>(rng: &mut R) -> Result<String, Error> {
    let mut bytes = [0u8; N];
    rng.try_fill_bytes(&mut bytes)
        .map_err(|e| Error::CryptoUnavailable(e.to_string()))?;
    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

/// Generates a cryptographically random code verifier for PKCE.
///
/// Returns a 128-character URL-safe string (RFC 7636 maximum).
///
/// # Errors
///
/// Returns [`Error::CryptoUnavailable`] if the OS random source fails.
pub fn generate_code_verifier() -> Result<String, Error> {
    random_b64::<96, _>(&mut OsRng)
}

/// Computes the S256 code challenge from a code verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
#[must_use]
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates a cryptographically random anti-CSRF `state` parameter.
///
/// Returns a 32-character URL-safe string (24 random bytes → base64url).
///
/// # Errors
///
/// Returns [`Error::CryptoUnavailable`] if the OS random source fails.
pub fn generate_state() -> Result<String, Error> {
    random_b64::<24, _>(&mut OsRng)
}

/// Pending PKCE exchange, persisted across the redirect to the provider.
///
/// Only one exists at a time; a new sign-in overwrites it and the callback
/// consumes it whatever the outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PkceExchange {
    pub code_verifier: String,
    pub code_challenge: String,
    pub state: String,
    pub redirect_uri: Url,
    pub return_url: Url,
}

impl PkceExchange {
    /// Creates a fresh verifier, challenge and state from the OS random source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CryptoUnavailable`] if the OS random source fails.
    pub fn generate(redirect_uri: Url, return_url: Url) -> Result<Self, Error> {
        Self::generate_with(&mut OsRng, redirect_uri, return_url)
    }

    /// Same as [`generate`](Self::generate) with a caller-supplied random source.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CryptoUnavailable`] if `rng` fails.
    pub fn generate_with<R: TryRngCore + ?Sized>(
        rng: &mut R,
        redirect_uri: Url,
        return_url: Url,
    ) -> Result<Self, Error> {
        let code_verifier = random_b64::<96, _>(rng)?;
        let code_challenge = generate_code_challenge(&code_verifier);
        Ok(Self {
            code_verifier,
            code_challenge,
            state: random_b64::<24, _>(rng)?,
            redirect_uri,
            return_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    /// Random source that is never available.
    struct NoEntropy;

    impl TryRngCore for NoEntropy {
        type Error = std::io::Error;

        fn try_next_u32(&mut self) -> Result<u32, Self::Error> {
            Err(std::io::Error::other("entropy source offline"))
        }

        fn try_next_u64(&mut self) -> Result<u64, Self::Error> {
            Err(std::io::Error::other("entropy source offline"))
        }

        fn try_fill_bytes(&mut self, _dst: &mut [u8]) -> Result<(), Self::Error> {
            Err(std::io::Error::other("entropy source offline"))
        }
    }

    fn page() -> Url {
        "https://gis.example.org/admin/index.html".parse().unwrap()
    }

    fn is_unreserved(c: char) -> bool {
        c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
    }

    #[test]
    fn test_code_challenge_rfc7636_vector() {
        // RFC 7636 appendix B
        let challenge = generate_code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_verifier_and_state_fit_rfc7636_alphabet() {
        let verifier = generate_code_verifier().unwrap();
        let state = generate_state().unwrap();
        assert!((43..=128).contains(&verifier.len()));
        assert_eq!(state.len(), 32);
        assert!(verifier.chars().chain(state.chars()).all(is_unreserved));
    }

    #[test]
    fn test_exchange_challenge_matches_verifier() {
        let exchange = PkceExchange::generate(page(), page()).unwrap();
        assert_eq!(
            exchange.code_challenge,
            generate_code_challenge(&exchange.code_verifier)
        );
        assert_ne!(exchange.code_verifier, exchange.state);
    }

    #[test]
    fn test_each_exchange_gets_fresh_secrets() {
        let exchanges: Vec<_> = (0..16)
            .map(|_| PkceExchange::generate(page(), page()).unwrap())
            .collect();
        let states: HashSet<_> = exchanges.iter().map(|e| e.state.as_str()).collect();
        let verifiers: HashSet<_> = exchanges.iter().map(|e| e.code_verifier.as_str()).collect();
        assert_eq!(states.len(), exchanges.len());
        assert_eq!(verifiers.len(), exchanges.len());
    }

    #[test]
    fn test_failing_random_source_is_crypto_unavailable() {
        let err = PkceExchange::generate_with(&mut NoEntropy, page(), page()).unwrap_err();
        assert!(matches!(err, Error::CryptoUnavailable(ref m) if m.contains("offline")));
    }

    #[test]
    fn test_exchange_record_uses_camel_case() {
        let exchange = PkceExchange::generate(page(), page()).unwrap();
        let json = serde_json::to_value(&exchange).unwrap();
        assert_eq!(json["codeVerifier"], exchange.code_verifier.as_str());
        assert_eq!(json["returnUrl"], "https://gis.example.org/admin/index.html");
    }
}
