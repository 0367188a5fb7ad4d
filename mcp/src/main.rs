use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use metabase_core::{Credential, Error};
use metabase_mcp_runtime::{McpServer, RetryPolicy, RuntimeConfig, parse_base_url};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod http;

#[derive(Parser)]
#[command(
    name = "metabase-mcp",
    version,
    about = "Metabase MCP server: exposes a Metabase instance as MCP tools over stdio or HTTP"
)]
struct Cli {
    /// Metabase base URL, e.g. https://metabase.example.com
    #[arg(long, env = "METABASE_URL")]
    metabase_url: String,

    /// Serve MCP over stdin/stdout (the default)
    #[arg(long, conflicts_with = "http")]
    stdio: bool,

    /// Serve MCP as JSON-RPC on POST /mcp
    #[arg(long)]
    http: bool,

    /// Bind address for --http
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port for --http
    #[arg(long, env = "PORT", default_value_t = 8000)]
    port: u16,

    /// Per-request timeout against Metabase
    #[arg(long, env = "METABASE_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Attempts per request for transient failures (5xx, connection errors)
    #[arg(long, env = "METABASE_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Log as JSON lines on stderr
    #[arg(long, env = "METABASE_MCP_LOG_JSON")]
    log_json: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "metabase_mcp=info,metabase_mcp_runtime=info,tower_http=info".into());
    // stdout belongs to the stdio transport.
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn build_server(cli: &Cli) -> Result<McpServer, Error> {
    let base_url = parse_base_url(&cli.metabase_url)?;
    let credential = Credential::from_env()?;
    if cli.timeout_secs == 0 {
        return Err(Error::Configuration(
            "METABASE_TIMEOUT_SECS must be at least 1".to_string(),
        ));
    }
    if cli.max_attempts == 0 {
        return Err(Error::Configuration(
            "METABASE_MAX_ATTEMPTS must be at least 1".to_string(),
        ));
    }
    tracing::info!(
        base_url = %base_url,
        auth_method = credential.method_name(),
        "metabase credentials resolved"
    );

    let config = RuntimeConfig::new(base_url, credential)
        .with_timeout(Duration::from_secs(cli.timeout_secs))
        .with_retry(RetryPolicy::default().with_max_attempts(cli.max_attempts));
    McpServer::new(config)
}

async fn run(cli: Cli) -> i32 {
    let server = match build_server(&cli) {
        Ok(server) => Arc::new(server),
        Err(err) => {
            tracing::error!(error = %err, "startup failed");
            if let Some(hint) = err.docs_hint() {
                eprintln!("{err}\n{hint}");
            }
            return 2;
        }
    };

    let result = if cli.http && !cli.stdio {
        http::serve(server.clone(), &cli.host, cli.port)
            .await
            .map_err(|e| format!("HTTP transport failed: {e}"))
    } else {
        server.serve_stdio().await
    };

    server.shutdown().await;
    match result {
        Ok(()) => 0,
        Err(message) => {
            tracing::error!(error = %message, "MCP server stopped with an error");
            1
        }
    }
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let code = run(cli).await;
    std::process::exit(code);
}
