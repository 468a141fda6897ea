use anyhow::Context;
use clap::Parser;
use inference_gateway::auth::{ApiKeyEntry, AuthConfig};
use inference_gateway::config::{
    ConfigResult, GatewayConfig, PromptConfig, RetrievalConfig, DEFAULT_RAG_TEMPLATE,
    DEFAULT_TOP_K, DEFAULT_UPSTREAM_URL,
};
use inference_gateway::logging::{init_logging, LoggingConfig};
use inference_gateway::server;

#[derive(Parser, Debug)]
#[command(name = "inference-gateway")]
#[command(about = "Streaming gateway in front of an Ollama-compatible inference server")]
#[command(long_about = r#"
Streaming gateway in front of an Ollama-compatible inference server

Relays /ollama/api/* to the upstream with per-request cancellation and
optional prompt injection, and serves retrieval over /rag/api/v1.

Examples:
  # Open access, default upstream
  inference-gateway --port 8080

  # Keyed access with a system prompt
  inference-gateway --upstream-url http://gpu-box:11434/api \
    --api-key admin:sk-ops --api-key user:sk-team \
    --system-prompt "Answer briefly."
"#)]
struct CliArgs {
    /// Host address to bind the gateway
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the gateway
    #[arg(long, default_value_t = 8080)]
    port: u16,

    /// Base URL of the inference server API
    #[arg(long, default_value = DEFAULT_UPSTREAM_URL)]
    upstream_url: String,

    /// Upstream request timeout in seconds (no timeout when omitted)
    #[arg(long)]
    request_timeout_secs: Option<u64>,

    /// Maximum request body size in bytes
    #[arg(long, default_value_t = 256 * 1024 * 1024)]
    max_payload_size: usize,

    /// System instruction inserted into every chat payload
    #[arg(long, conflicts_with = "system_prompt_file")]
    system_prompt: Option<String>,

    /// File holding the system instruction
    #[arg(long)]
    system_prompt_file: Option<String>,

    /// Text prepended to every user message
    #[arg(long)]
    user_prefix: Option<String>,

    /// API key as <role>:<key>; repeatable. Roles: admin, user, pending
    #[arg(long = "api-key")]
    api_keys: Vec<String>,

    /// Default number of documents returned by retrieval queries
    #[arg(long, default_value_t = DEFAULT_TOP_K)]
    top_k: usize,

    /// Retrieval prompt template
    #[arg(long)]
    rag_template: Option<String>,

    /// Log level
    #[arg(long, default_value = "info", value_parser = ["debug", "info", "warn", "error"])]
    log_level: String,

    /// Directory for log files
    #[arg(long)]
    log_dir: Option<String>,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

impl CliArgs {
    fn to_gateway_config(&self, system_prompt: Option<String>) -> ConfigResult<GatewayConfig> {
        let api_keys = self
            .api_keys
            .iter()
            .enumerate()
            .map(|(i, spec)| ApiKeyEntry::parse(format!("key-{}", i), spec))
            .collect::<ConfigResult<Vec<_>>>()?;

        Ok(GatewayConfig {
            host: self.host.clone(),
            port: self.port,
            upstream_base_url: self.upstream_url.clone(),
            request_timeout_secs: self.request_timeout_secs,
            max_payload_size: self.max_payload_size,
            prompt: PromptConfig {
                system_prompt,
                user_prefix: self.user_prefix.clone(),
            },
            auth: AuthConfig { api_keys },
            retrieval: RetrievalConfig {
                top_k: self.top_k,
                template: self
                    .rag_template
                    .clone()
                    .unwrap_or_else(|| DEFAULT_RAG_TEMPLATE.to_string()),
            },
            log_level: Some(self.log_level.clone()),
            log_dir: self.log_dir.clone(),
            log_json: self.log_json,
        })
    }
}

fn main() -> anyhow::Result<()> {
    let cli_args = CliArgs::parse();

    let system_prompt = match &cli_args.system_prompt_file {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read system prompt file {}", path))?,
        ),
        None => cli_args.system_prompt.clone(),
    };

    let config = cli_args.to_gateway_config(system_prompt)?;
    config.validate()?;

    let _log_guard = init_logging(LoggingConfig {
        level: LoggingConfig::level_from_str(config.log_level.as_deref()),
        json_format: config.log_json,
        log_dir: config.log_dir.clone(),
        ..Default::default()
    });

    actix_web::rt::System::new()
        .block_on(server::startup(config))
        .context("Gateway server failed")?;

    Ok(())
}
