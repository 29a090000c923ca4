//! Search command: discover systems to download

use super::{Cli, CliError, CredentialArgs, OutputFormat};
use crate::fetcher::PvOutputClient;
use crate::SearchResult;
use clap::Args;
use std::path::{Path, PathBuf};
use tracing::info;

/// Search arguments
#[derive(Debug, Args)]
pub struct SearchArgs {
    /// Search text, using PVOutput search syntax (e.g. "5km", "+solar", "2000")
    pub query: String,

    /// Search around a coordinate, as LAT,LON
    #[arg(long, value_parser = parse_coordinate)]
    pub near: Option<(f64, f64)>,

    /// Also write results to a CSV usable with `download --systems-csv`
    #[arg(long)]
    pub output_csv: Option<PathBuf>,

    /// Credentials
    #[command(flatten)]
    pub credentials: CredentialArgs,
}

/// Parse `LAT,LON`.
pub fn parse_coordinate(input: &str) -> Result<(f64, f64), String> {
    let (lat, lon) = input
        .split_once(',')
        .ok_or_else(|| format!("'{input}' is not LAT,LON"))?;
    let lat: f64 = lat
        .trim()
        .parse()
        .map_err(|_| format!("invalid latitude '{lat}'"))?;
    let lon: f64 = lon
        .trim()
        .parse()
        .map_err(|_| format!("invalid longitude '{lon}'"))?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
        return Err(format!("coordinate {lat},{lon} out of range"));
    }
    Ok((lat, lon))
}

impl SearchArgs {
    /// Execute the search
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let credentials = self.credentials.credentials()?;
        let client = PvOutputClient::new(credentials)?.with_base_url(&self.credentials.base_url);

        let results = client.search(&self.query, self.near).await?;
        info!(query = %self.query, results = results.len(), "Search finished");

        if let Some(path) = &self.output_csv {
            write_results_csv(path, &results)?;
        }

        match cli.output_format {
            OutputFormat::Json => {
                let json = serde_json::to_string_pretty(&results).map_err(|e| {
                    CliError::InvalidArgument(format!("Failed to serialize results: {e}"))
                })?;
                println!("{json}");
            }
            OutputFormat::Human => {
                println!("Found {} systems:\n", results.len());
                for result in &results {
                    let capacity = result
                        .system_dc_capacity_w
                        .map(|w| format!("{w:.0} W"))
                        .unwrap_or_else(|| "? W".to_string());
                    println!(
                        "{} | {} | {} | {} | last output {}",
                        result.system_id, result.name, capacity, result.address, result.last_output
                    );
                }
            }
        }
        Ok(())
    }
}

fn write_results_csv(path: &Path, results: &[SearchResult]) -> Result<(), CliError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| CliError::InvalidArgument(format!("{}: {e}", path.display())))?;
    for result in results {
        writer
            .serialize(result)
            .map_err(|e| CliError::InvalidArgument(format!("{}: {e}", path.display())))?;
    }
    writer
        .flush()
        .map_err(|e| CliError::InvalidArgument(format!("{}: {e}", path.display())))?;
    Ok(())
}
