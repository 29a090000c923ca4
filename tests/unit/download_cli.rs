//! Unit tests for download command-line parsing

use clap::Parser;
use pvoutput_backfill::cli::download::{Cli, Commands, OutputFormat, ResumeMode};
use pvoutput_backfill::fetcher::pvoutput_config::QuotaTier;
use std::path::PathBuf;

fn download_args(extra: &[&str]) -> Vec<String> {
    let mut args = vec![
        "pvoutput-backfill",
        "download",
        "--systems",
        "6112,4232",
        "--start-date",
        "2023-06-01",
        "--end-date",
        "2023-06-30",
    ];
    args.extend_from_slice(extra);
    args.into_iter().map(String::from).collect()
}

/// Omitted global flags fall back to their defaults
#[test]
fn test_cli_defaults() {
    let cli = Cli::parse_from(download_args(&[]));

    assert_eq!(cli.max_retries, 5, "Default max_retries should be 5");
    assert_eq!(cli.resume, ResumeMode::On);
    assert_eq!(cli.output_format, OutputFormat::Human);
    assert_eq!(cli.resume_dir(), PathBuf::from(".resume"));
    assert_eq!(cli.output_dir(), PathBuf::from("data"));
    assert!(cli.metrics_addr.is_none());

    let Commands::Download(args) = &cli.command else {
        panic!("expected download command");
    };
    assert_eq!(args.tier, QuotaTier::Free);
    assert_eq!(args.quota().max_requests_per_window, 60);
    assert!(!args.metadata);
    assert_eq!(args.min_data_availability, None);
    assert_eq!(args.system_ids().unwrap().len(), 2);
    assert_eq!(args.span().unwrap().days(), 30);
}

/// Global flags are accepted after the subcommand too
#[test]
fn test_cli_respects_global_flags_after_subcommand() {
    let cli = Cli::parse_from(download_args(&[
        "--max-retries",
        "10",
        "--resume",
        "reset",
        "--output-format",
        "json",
        "--metrics-addr",
        "127.0.0.1:9000",
    ]));

    assert_eq!(cli.max_retries, 10);
    assert_eq!(cli.resume, ResumeMode::Reset);
    assert_eq!(cli.output_format, OutputFormat::Json);
    assert_eq!(cli.metrics_addr.unwrap().port(), 9000);
}

#[test]
fn test_reversed_span_is_rejected_at_execution() {
    let args: Vec<String> = download_args(&[])
        .into_iter()
        .map(|a| if a == "2023-06-30" { "2023-05-01".to_string() } else { a })
        .collect();
    let cli = Cli::parse_from(args);
    let Commands::Download(args) = &cli.command else {
        panic!("expected download command");
    };
    assert!(args.span().is_err());
}

#[test]
fn test_systems_and_csv_conflict() {
    let result = Cli::try_parse_from(download_args(&["--systems-csv", "systems.csv"]));
    assert!(result.is_err());
}

#[test]
fn test_systems_required() {
    let result = Cli::try_parse_from([
        "pvoutput-backfill",
        "download",
        "--start-date",
        "2023-06-01",
        "--end-date",
        "2023-06-30",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_min_data_availability_flag() {
    let cli = Cli::parse_from(download_args(&["--min-data-availability", "0.75"]));
    let Commands::Download(args) = &cli.command else {
        panic!("expected download command");
    };
    assert_eq!(args.min_data_availability, Some(0.75));

    let result = Cli::try_parse_from(download_args(&["--min-data-availability", "2"]));
    assert!(result.is_err());
}
