//! CLI command implementations

pub mod download;
pub mod error;
pub mod purge;
pub mod search;
pub mod validate;

pub use download::{Cli, Commands, DownloadArgs, OutputFormat, ResumeMode};
pub use error::CliError;
pub use purge::PurgeArgs;
pub use search::SearchArgs;
pub use validate::ValidateCommand;

use crate::fetcher::pvoutput_config::Credentials;
use clap::Args;

/// PVOutput credentials, from flags or the environment
#[derive(Args, Debug, Clone)]
pub struct CredentialArgs {
    /// PVOutput API key
    #[arg(long, env = "PVOUTPUT_AUTH_APIKEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// System id of the API key's owner
    #[arg(long, env = "PVOUTPUT_AUTH_SYSTEMID")]
    pub owner_system_id: Option<String>,

    /// Data service URL for batch status access (paid subscribers)
    #[arg(long, env = "DATA_SERVICE_URL")]
    pub data_service_url: Option<String>,

    /// Service API host
    #[arg(long, hide = true, default_value = crate::fetcher::pvoutput_config::BASE_URL)]
    pub base_url: String,
}

impl CredentialArgs {
    /// Build validated credentials, failing when the key or owner id is missing.
    pub fn credentials(&self) -> Result<Credentials, CliError> {
        let api_key = self.api_key.clone().ok_or_else(|| {
            CliError::ConfigurationError(
                "missing API key: pass --api-key or set PVOUTPUT_AUTH_APIKEY".to_string(),
            )
        })?;
        let owner = self.owner_system_id.clone().ok_or_else(|| {
            CliError::ConfigurationError(
                "missing owner system id: pass --owner-system-id or set PVOUTPUT_AUTH_SYSTEMID"
                    .to_string(),
            )
        })?;
        Ok(Credentials::new(api_key, owner, self.data_service_url.clone())?)
    }
}
