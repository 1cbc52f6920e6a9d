mod manager;
mod pkce;
mod store;
mod token;

pub use manager::{OAuthConfig, OAuthError, TokenManager, TokenStatus};
pub use pkce::PkceCodes;
pub use store::{EncryptedFileStore, KeyringStore, MemoryStore, SecretStore, StoreError};
pub use token::OAuthToken;
