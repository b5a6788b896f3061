//! API server binary.
//!
//! Parameters come from an optional YAML file overlaid with command-line
//! flags.  Any configuration or storage error is fatal and exits non-zero
//! before a listener is bound.

use std::path::PathBuf;
use std::process::ExitCode;

use apiserver::config::{load_config, LoggingConfig, RawConfig};
use clap::Parser;
use tracing::{error, info};

/// Command-line arguments.  Every flag overrides the config file.
#[derive(Parser, Debug)]
#[command(name = "apiserver", version, about = "Cluster control-plane API server")]
struct Cli {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// The IP address to serve on.
    #[arg(long)]
    address: Option<String>,

    /// The port to listen on.
    #[arg(long)]
    port: Option<u16>,

    /// The prefix for API requests on the server.
    #[arg(long)]
    api_prefix: Option<String>,

    /// The version to store resources with.  Defaults to the server preferred version.
    #[arg(long)]
    storage_version: Option<String>,

    /// List of etcd servers to watch (http://ip:port), comma separated.
    /// Mutually exclusive with --etcd-config.
    #[arg(long, value_delimiter = ',')]
    etcd_servers: Option<Vec<String>>,

    /// The config file for the etcd client.  Mutually exclusive with --etcd-servers.
    #[arg(long)]
    etcd_config: Option<PathBuf>,

    /// The provider for cloud services.
    #[arg(long)]
    cloud_provider: Option<String>,

    /// The path to the cloud provider configuration file.
    #[arg(long)]
    cloud_config: Option<PathBuf>,

    /// With --cloud-provider, a regular expression matching minion instances.
    #[arg(long)]
    minion_regexp: Option<String>,

    /// List of machines to schedule onto, comma separated.
    #[arg(long, value_delimiter = ',')]
    machines: Option<Vec<String>>,

    /// Health check minions and filter unhealthy ones.
    #[arg(long)]
    health_check_minions: Option<bool>,

    /// Seconds to cache minion information.
    #[arg(long)]
    minion_cache_ttl_secs: Option<u64>,

    /// If set, the file used to secure the API port via token authentication.
    #[arg(long)]
    token_auth_file: Option<PathBuf>,

    /// List of allowed origins for CORS, comma separated.  Each entry is a
    /// regular expression; CORS is disabled when empty.
    #[arg(long, value_delimiter = ',')]
    cors_allowed_origins: Option<Vec<String>>,

    /// The amount of MilliCPU provisioned on each node.
    #[arg(long)]
    node_milli_cpu: Option<i64>,

    /// The amount of memory (in bytes) provisioned on each node.
    #[arg(long)]
    node_memory: Option<i64>,

    /// Log level: trace, debug, info, warn, error.
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: text or json.
    #[arg(long)]
    log_format: Option<String>,
}

impl Cli {
    /// Apply every flag that was given on top of `raw`.
    fn overlay(self, mut raw: RawConfig) -> RawConfig {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { raw.$field = v; })*
            };
        }
        macro_rules! set_opt {
            ($($field:ident),*) => {
                $(if let Some(v) = self.$field { raw.$field = Some(v); })*
            };
        }
        set!(
            address,
            port,
            api_prefix,
            storage_version,
            etcd_servers,
            machines,
            health_check_minions,
            minion_cache_ttl_secs,
            cors_allowed_origins,
            node_milli_cpu,
            node_memory
        );
        set_opt!(
            etcd_config,
            cloud_provider,
            cloud_config,
            minion_regexp,
            token_auth_file
        );
        if let Some(level) = self.log_level {
            raw.logging.level = level;
        }
        if let Some(format) = self.log_format {
            raw.logging.format = format;
        }
        raw
    }
}

fn init_logging(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(raw: RawConfig) -> anyhow::Result<()> {
    let config = raw.resolve()?;
    let listen = config.listen;
    let app = apiserver::server::build_app(config)?;
    apiserver::server::serve(listen, app).await?;
    info!("API server shut down");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let file = match cli.config.as_deref().map(load_config).transpose() {
        Ok(file) => file.unwrap_or_default(),
        Err(e) => {
            eprintln!("apiserver: {e}");
            return ExitCode::FAILURE;
        }
    };
    let raw = cli.overlay(file);
    init_logging(&raw.logging);

    match run(raw).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
