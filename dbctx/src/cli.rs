//! Command-line arguments and data source resolution.

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand, ValueEnum};
use dbctx_core::{DataSourceConfig, InvalidationMode};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dbctx")]
#[command(about = "Execution-context lifecycle tool")]
#[command(version)]
#[command(long_about = "
dbctx - Execution contexts with coordinated reconnection

Opens execution contexts against a data source, probes them and drives the
BEFORE/INVALIDATE/AFTER reconnection protocol across all of them.

SECURITY FEATURES:
- Credentials are redacted from every log line and report
- Passwords can be supplied out of band via DBCTX_PASSWORD
- Driver libraries are installed from a local mirror only

EXAMPLES:
  dbctx --database-url postgres://app@localhost/crm test
  dbctx --config crm.json invalidate --contexts 4 --output report.json
  dbctx --database-url sqlite:///var/app.db keepalive --interval 30
")]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(flatten)]
    pub source: SourceArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect one context and run an alive probe
    Test,
    /// Open contexts and run a coordinated invalidation over them
    Invalidate(InvalidateArgs),
    /// Keep contexts alive until interrupted
    #[command(name = "keepalive")]
    KeepAlive(KeepAliveArgs),
    /// List known drivers and whether they are compiled in
    Drivers,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Increase verbosity
    #[arg(
        short,
        long,
        global = true,
        action = clap::ArgAction::Count,
        help = "Increase verbosity (-v, -vv, -vvv)"
    )]
    pub verbose: u8,

    /// Suppress output
    #[arg(short, long, global = true, help = "Suppress all output except errors")]
    pub quiet: bool,
}

/// Data source selection. Not `Debug`: it carries the password.
#[derive(Args)]
pub struct SourceArgs {
    /// Data source config file
    #[arg(long, global = true, help = "JSON data source configuration file")]
    pub config: Option<PathBuf>,

    /// Database connection URL
    #[arg(
        long,
        global = true,
        env = "DATABASE_URL",
        help = "Database connection string (credentials will be sanitized in logs)"
    )]
    pub database_url: Option<String>,

    /// Out-of-band password
    #[arg(long, env = "DBCTX_PASSWORD", hide = true, hide_env_values = true)]
    pub password: Option<String>,

    /// Data source label
    #[arg(long, global = true, default_value = "default", help = "Data source name")]
    pub name: String,

    /// Open links read-only
    #[arg(long, global = true, help = "Open every backend link read-only")]
    pub read_only: bool,

    /// Default schema restored after each reconnect
    #[arg(long, global = true, help = "Default schema restored after reconnects")]
    pub schema: Option<String>,

    /// Default catalog restored after each reconnect
    #[arg(long, global = true, help = "Default catalog restored after reconnects")]
    pub catalog: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Reconnect every context in use
    Force,
    /// Probe first and reconnect only dead contexts
    IfDead,
}

impl From<ModeArg> for InvalidationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Force => Self::Force,
            ModeArg::IfDead => Self::IfDead,
        }
    }
}

#[derive(Args, Debug)]
pub struct InvalidateArgs {
    /// Number of contexts to open
    #[arg(long, default_value = "2", value_parser = clap::value_parser!(u16).range(1..))]
    pub contexts: u16,

    /// Selection mode
    #[arg(long, value_enum, default_value = "force")]
    pub mode: ModeArg,

    /// Contexts invalidated concurrently
    #[arg(long, default_value = "4")]
    pub concurrency: usize,

    /// Report file; stdout when absent
    #[arg(short, long, help = "Write the JSON report to this file")]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct KeepAliveArgs {
    /// Number of contexts to keep open
    #[arg(long, default_value = "1", value_parser = clap::value_parser!(u16).range(1..))]
    pub contexts: u16,

    /// Seconds between probe rounds
    #[arg(long, default_value = "60", value_parser = clap::value_parser!(u64).range(1..))]
    pub interval: u64,

    /// Only report dead contexts
    #[arg(long, help = "Probe without reconnecting dead contexts")]
    pub no_reconnect: bool,
}

impl SourceArgs {
    /// Builds the data source config from the config file and overrides.
    ///
    /// # Errors
    /// Returns error if neither a config file nor a URL is given, or the
    /// result does not validate
    pub async fn resolve(&self) -> Result<DataSourceConfig> {
        let mut config = match (&self.config, &self.database_url) {
            (Some(path), _) => DataSourceConfig::load(path)
                .await
                .with_context(|| format!("Failed to load {}", path.display()))?,
            (None, Some(url)) => DataSourceConfig::from_url(&self.name, url.as_str()),
            (None, None) => bail!("Either --config or --database-url (DATABASE_URL) is required"),
        };

        if self.config.is_some()
            && let Some(url) = &self.database_url
        {
            config.connection.url.clone_from(url);
        }
        if let Some(password) = &self.password {
            config.connection = config.connection.with_password(password.as_str());
        }
        if self.read_only {
            config.connection.read_only = true;
        }
        if let Some(schema) = &self.schema {
            config.connection.default_schema = Some(schema.clone());
        }
        if let Some(catalog) = &self.catalog {
            config.connection.default_catalog = Some(catalog.clone());
        }

        config.validate()?;
        Ok(config)
    }
}
