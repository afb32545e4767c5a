mod vault;

pub use vault::{CredentialVault, KEY_ENV_VAR};
