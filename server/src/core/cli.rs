use clap::{Parser, Subcommand};

use std::path::PathBuf;

use super::config::{Environment, StoreBackendType};
use super::constants::{
    ENV_CONFIG, ENV_DURABILITY, ENV_ENVIRONMENT, ENV_KEY_PREFIX, ENV_STORE_BACKEND, ENV_STORE_URL,
};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(version, about = "Multi-tenant realtime event gateway", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = ENV_CONFIG)]
    pub config: Option<PathBuf>,

    /// Deploy environment (development or production)
    #[arg(long, global = true, env = ENV_ENVIRONMENT, value_parser = parse_environment)]
    pub environment: Option<Environment>,

    /// Store backend (memory or redis)
    #[arg(long, global = true, env = ENV_STORE_BACKEND, value_parser = parse_store_backend)]
    pub store_backend: Option<StoreBackendType>,

    /// Redis-compatible store URL
    #[arg(long, global = true, env = ENV_STORE_URL)]
    pub store_url: Option<String>,

    /// Key namespace prefix
    #[arg(long, global = true, env = ENV_KEY_PREFIX)]
    pub prefix: Option<String>,

    /// Enable the durable replay path
    #[arg(long, global = true, env = ENV_DURABILITY)]
    pub durability: Option<bool>,

    /// Disable authentication (for development; rejected in production)
    #[arg(long, global = true)]
    pub no_auth: bool,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Commands {
    /// Start the gateway replica (default)
    Start,
}

/// Parsed CLI configuration handed to config loading
pub struct CliConfig {
    pub config: Option<PathBuf>,
    pub environment: Option<Environment>,
    pub store_backend: Option<StoreBackendType>,
    pub store_url: Option<String>,
    pub prefix: Option<String>,
    pub durability: Option<bool>,
    pub no_auth: bool,
}

fn parse_environment(s: &str) -> Result<Environment, String> {
    s.parse()
}

fn parse_store_backend(s: &str) -> Result<StoreBackendType, String> {
    s.parse()
}

/// Parse command-line arguments
pub fn parse() -> (CliConfig, Option<Commands>) {
    let cli = Cli::parse();
    (
        CliConfig {
            config: cli.config,
            environment: cli.environment,
            store_backend: cli.store_backend,
            store_url: cli.store_url,
            prefix: cli.prefix,
            durability: cli.durability,
            no_auth: cli.no_auth,
        },
        cli.command,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from([
            "beacon",
            "--store-backend",
            "redis",
            "--store-url",
            "redis://localhost:6379",
            "--prefix",
            "gw",
            "--no-auth",
        ]);
        assert_eq!(cli.store_backend, Some(StoreBackendType::Redis));
        assert_eq!(cli.store_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(cli.prefix.as_deref(), Some("gw"));
        assert!(cli.no_auth);
    }

    #[test]
    fn test_cli_rejects_bad_backend() {
        let result = Cli::try_parse_from(["beacon", "--store-backend", "etcd"]);
        assert!(result.is_err());
    }
}
