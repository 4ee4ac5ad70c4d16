//! Credential handling and token acquisition.

pub mod authenticator;
pub mod bridge;
pub mod certificate;
pub mod exchange;
pub mod identity;
pub mod models;
pub mod prompt;
pub mod resource;
pub mod store;
pub mod strategies;
pub mod token_cache;

pub use authenticator::{Authenticator, TokenProvider};
pub use bridge::{PowerShellBridge, SessionBridge};
pub use certificate::{CertificateBundle, CertificateManager, CertificateMetadata};
pub use exchange::{DependentServiceAuthenticator, ExchangeSession, ExchangeSettings};
pub use identity::{IdentityClient, IdentityEndpoints};
pub use models::{AuthParams, AuthenticationMethod, AuthenticationResult, TokenInfo};
pub use prompt::{ConsolePrompt, SilentPrompt, UserPrompt};
pub use resource::{BoundCredentials, ResourceAuthenticator};
pub use store::CertificateStore;
pub use strategies::AuthStrategy;
pub use token_cache::{CacheKey, TokenCache};
