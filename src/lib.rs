#![doc = include_str!("../README.md")]

pub mod authenticator;
pub mod config;
pub mod error;
pub mod events;
pub mod org;
pub mod pkce;
pub mod provider;
pub mod session;
pub mod storage;

// Re-exports for convenient access
pub use authenticator::{Authenticator, CallbackParams, SignIn, SignInComplete};
pub use config::AuthConfig;
pub use error::{Error, ErrorKind};
pub use events::{AuthEvent, EventBus, EventKind, SubscriptionId};
pub use org::OrganizationAllowList;
pub use pkce::{PkceExchange, generate_code_challenge, generate_code_verifier, generate_state};
#[cfg(feature = "portal")]
pub use provider::PortalClient;
pub use provider::{
    ApiMethod, ApiRequest, ApiResponse, IdentityProvider, PortalProfile, TokenGrant, TokenRequest,
};
pub use session::{Session, UserInfo};
pub use storage::{JsonFileStorage, MemoryStorage, SessionStorage};
