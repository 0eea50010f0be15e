//! Command-line interface argument parsing.
//!
//! This module handles all CLI argument parsing using clap,
//! including validation and default values.

use crate::models::Severity;
use clap::Parser;
use std::path::PathBuf;

/// PageAudit - multi-module web page analyzer
///
/// Captures a page once, runs accessibility, structure and performance
/// analysis in parallel worker pools and writes a Markdown or JSON report.
///
/// Examples:
///   pageaudit --url https://example.com
///   pageaudit --url https://example.com --modules a11y,structure --format json
///   pageaudit --url https://example.com --fail-on serious
///   pageaudit --init-config
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// URL of the page to analyze
    #[arg(short, long, value_name = "URL", required_unless_present = "init_config")]
    pub url: Option<String>,

    /// Tenant the analysis is submitted for
    #[arg(short, long, value_name = "ID", env = "PAGEAUDIT_TENANT")]
    pub tenant: Option<String>,

    /// Analysis modules to run (comma-separated)
    ///
    /// Example: --modules accessibility,performance
    #[arg(short, long, value_name = "MODULES", value_delimiter = ',')]
    pub modules: Option<Vec<String>>,

    /// Output file path for the report
    #[arg(
        short,
        long,
        default_value = "pageaudit_report.md",
        value_name = "FILE"
    )]
    pub output: PathBuf,

    /// Output format (markdown, json)
    #[arg(long, default_value = "markdown", value_name = "FORMAT")]
    pub format: OutputFormat,

    /// Path to configuration file
    ///
    /// If not specified, looks for .pageaudit.toml in the current directory
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// SQLite URL of the status store
    #[arg(long, value_name = "URL", env = "PAGEAUDIT_DATABASE_URL")]
    pub database_url: Option<String>,

    /// Directory captured pages are stored in
    #[arg(long, value_name = "DIR")]
    pub assets_dir: Option<PathBuf>,

    /// Workers per analysis module
    #[arg(long, value_name = "NUM")]
    pub concurrency: Option<usize>,

    /// Time limit for a single module, in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Page request timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub fetch_timeout: Option<u64>,

    /// Enable verbose logging output
    #[arg(short, long)]
    pub verbose: bool,

    /// Run in quiet mode (minimal output)
    #[arg(short, long)]
    pub quiet: bool,

    /// Fail if findings at or above this severity are found
    ///
    /// Useful for CI pipelines. Exit code 2 when threshold is exceeded.
    /// Values: critical, serious, moderate, minor
    #[arg(long, value_name = "LEVEL")]
    pub fail_on: Option<FailOnLevel>,

    /// Generate a default .pageaudit.toml configuration file
    #[arg(long)]
    pub init_config: bool,
}

/// Output format for the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum OutputFormat {
    /// Markdown format (default)
    #[default]
    Markdown,
    /// JSON format
    Json,
}

/// Severity level for --fail-on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum FailOnLevel {
    Minor,
    Moderate,
    Serious,
    Critical,
}

impl From<FailOnLevel> for Severity {
    fn from(level: FailOnLevel) -> Self {
        match level {
            FailOnLevel::Minor => Severity::Minor,
            FailOnLevel::Moderate => Severity::Moderate,
            FailOnLevel::Serious => Severity::Serious,
            FailOnLevel::Critical => Severity::Critical,
        }
    }
}

impl Args {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// The target URL, empty when not given (validated first).
    pub fn target_url(&self) -> &str {
        self.url.as_deref().unwrap_or("")
    }

    /// Validate the parsed arguments.
    pub fn validate(&self) -> Result<(), String> {
        // Skip validation for --init-config
        if self.init_config {
            return Ok(());
        }

        let url = self.target_url();
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err("URL must start with 'http://' or 'https://'".to_string());
        }

        if let Some(ref modules) = self.modules {
            if modules.is_empty() || modules.iter().any(|m| m.trim().is_empty()) {
                return Err("Module list must not contain empty entries".to_string());
            }
        }

        if self.concurrency == Some(0) {
            return Err("Concurrency must be at least 1".to_string());
        }

        // Check for conflicting options
        if self.verbose && self.quiet {
            return Err("Cannot use both --verbose and --quiet".to_string());
        }

        if self.timeout == Some(0) || self.fetch_timeout == Some(0) {
            return Err("Timeout must be at least 1 second".to_string());
        }

        Ok(())
    }

    /// Returns the log level based on verbosity settings.
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        }
    }
}
