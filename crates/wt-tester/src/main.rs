//! Web Thing conformance tester
//!
//! Runs the conformance sequence against one live Web Thing server and exits
//! non-zero if any stage fails.

use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use wt_conformance::config::{local_ip, DEFAULT_PORT};
use wt_conformance::{
    ActionEndpoint, CompletionWait, ConformanceRun, SchemaVersion, Scheme, TargetConfig, WaitMode,
};

#[derive(Parser)]
#[command(name = "webthing-tester")]
#[command(about = "Web Thing conformance tester")]
#[command(version)]
struct Cli {
    /// Protocol used to reach the server: http or https
    #[arg(long, default_value = "http", value_parser = Scheme::from_str, env = "WEBTHING_PROTOCOL")]
    protocol: Scheme,

    /// Server hostname or IP address (defaults to this machine's address)
    #[arg(long, env = "WEBTHING_HOST")]
    host: Option<String>,

    /// Server port
    #[arg(long, default_value_t = DEFAULT_PORT, env = "WEBTHING_PORT")]
    port: u16,

    /// Path prefix to get to the thing description
    #[arg(long, default_value = "", env = "WEBTHING_PATH_PREFIX")]
    path_prefix: String,

    /// Authorization header, i.e. "Bearer ..."
    #[arg(long, env = "WEBTHING_AUTH_HEADER")]
    auth_header: Option<String>,

    /// Thing description format the server is expected to serve: legacy or current
    #[arg(long, default_value = "current", value_parser = SchemaVersion::from_str, env = "WEBTHING_SCHEMA")]
    schema: SchemaVersion,

    /// Collection REST action requests are posted to: collection or typed
    #[arg(
        long,
        default_value = "collection",
        value_parser = ActionEndpoint::from_str,
        env = "WEBTHING_ACTION_ENDPOINT"
    )]
    action_endpoint: ActionEndpoint,

    /// How to wait for REST actions to complete: fixed or poll
    #[arg(
        long,
        default_value = "fixed",
        value_parser = WaitMode::from_str,
        env = "WEBTHING_COMPLETION_WAIT"
    )]
    completion_wait: WaitMode,

    /// Grace period for the fixed wait, in milliseconds
    #[arg(long, env = "WEBTHING_GRACE_MS")]
    grace_ms: Option<u64>,

    /// Overall timeout for the polling wait, in milliseconds
    #[arg(long, env = "WEBTHING_POLL_TIMEOUT_MS")]
    poll_timeout_ms: Option<u64>,

    /// Log all requests and WebSocket frames
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn target(&self) -> TargetConfig {
        let host = self.host.clone().unwrap_or_else(local_ip);
        let completion = CompletionWait::from_mode(
            self.completion_wait,
            self.grace_ms.map(Duration::from_millis),
            self.poll_timeout_ms.map(Duration::from_millis),
        );

        let mut config = TargetConfig::new(self.protocol, host, self.port)
            .with_path_prefix(self.path_prefix.as_str())
            .with_schema(self.schema)
            .with_action_endpoint(self.action_endpoint)
            .with_completion(completion);

        if let Some(ref header) = self.auth_header {
            config = config.with_authorization(header.as_str());
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config = cli.target();
    info!(url = %config.url("/"), "testing web thing");

    let mut run = ConformanceRun::new(config);
    let passed = run.run().await;
    run.print_summary();

    Ok(if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
