use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the peercache binary.
#[derive(Debug, Parser)]
#[command(
    name = "peercache",
    version,
    about = "Services sharing a conditional cache with record-level invalidation"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "PEERCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the todo service.
    Todo(ServeArgs),
    /// Run the gateway in front of the todo service.
    Gateway(GatewayArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GatewayArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,

    /// Override the todo service base URL.
    #[arg(long = "upstream-todo-url", value_name = "URL")]
    pub todo_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Toggle ETag validation of this service's own responses.
    #[arg(
        long = "cache-server",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub enable_server_cache: Option<bool>,

    /// Toggle revalidation of responses fetched from peers.
    #[arg(
        long = "cache-client",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub enable_client_cache: Option<bool>,

    /// Override the largest response body buffered for hashing.
    #[arg(long = "cache-max-body-bytes", value_name = "BYTES")]
    pub cache_max_body_bytes: Option<u64>,

    /// Override how many redirects outbound calls follow.
    #[arg(long = "cache-max-redirects", value_name = "COUNT")]
    pub cache_max_redirects: Option<u32>,
}
