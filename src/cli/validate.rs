//! Validation subcommand

use super::download::verify_states;
use super::{Cli, CliError, CredentialArgs};
use crate::fetcher::PvOutputClient;
use crate::identifier::SystemId;
use crate::resume::FileStore;
use clap::Parser;

/// Validate command for checking system ids, saved state and credentials
#[derive(Parser, Debug)]
pub struct ValidateCommand {
    /// What to validate
    #[command(subcommand)]
    pub target: ValidateTarget,
}

/// Target type for validation
#[derive(clap::Subcommand, Debug)]
pub enum ValidateTarget {
    /// Validate a comma separated list of system ids
    Systems {
        /// System ids to validate (e.g. 6112,4232)
        systems: String,
    },
    /// Validate every saved resume state in the resume directory
    ResumeState,
    /// Check credentials with one request against the owner's own system
    Credentials {
        /// Credentials
        #[command(flatten)]
        credentials: CredentialArgs,
    },
}

impl ValidateCommand {
    /// Execute the validation command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        match &self.target {
            ValidateTarget::Systems { systems } => self.validate_systems(systems),
            ValidateTarget::ResumeState => self.validate_resume_state(cli),
            ValidateTarget::Credentials { credentials } => {
                self.validate_credentials(credentials).await
            }
        }
    }

    fn validate_systems(&self, systems: &str) -> Result<(), CliError> {
        match SystemId::parse_list(systems) {
            Ok(ids) => {
                println!("Valid system ids: {}", ids.len());
                for id in ids {
                    println!("  {id}");
                }
                Ok(())
            }
            Err(e) => {
                eprintln!("Invalid system ids: {e}");
                Err(e.into())
            }
        }
    }

    fn validate_resume_state(&self, cli: &Cli) -> Result<(), CliError> {
        let resume_dir = cli.resume_dir();
        if !resume_dir.exists() {
            println!("No resume state found at {}", resume_dir.display());
            return Ok(());
        }
        if !resume_dir.is_dir() {
            return Err(CliError::InvalidArgument(format!(
                "{} is not a directory",
                resume_dir.display()
            )));
        }

        let store = FileStore::new(cli.output_dir(), &resume_dir);
        let systems = store.saved_systems()?;
        if systems.is_empty() {
            println!("Resume directory exists but contains no state files");
            return Ok(());
        }

        println!("Found {} resume state file(s)", systems.len());
        let (valid, invalid) = verify_states(&store, &systems);
        println!("\nSummary:");
        println!("  Valid files: {valid}");
        if invalid > 0 {
            println!("  Invalid files: {invalid}");
            return Err(CliError::InvalidArgument(format!(
                "Found {invalid} invalid resume state file(s)"
            )));
        }
        Ok(())
    }

    async fn validate_credentials(&self, args: &CredentialArgs) -> Result<(), CliError> {
        let credentials = args.credentials()?;
        let owner = SystemId::parse(credentials.system_id())?;
        let client = PvOutputClient::new(credentials)?.with_base_url(&args.base_url);

        let statistic = client.get_statistic(owner, None).await?;
        println!("Credentials accepted for system {owner}");
        if let Some(span) = statistic.and_then(|s| s.data_span()) {
            println!("  Data available: {span}");
        }
        if client.has_batch_access() {
            println!("  Data service configured: batch downloads available");
        }
        Ok(())
    }
}
