// Shared by several test binaries; not every helper is used by each one.
#![allow(dead_code)]

pub mod mock_upstream;

use std::{future::poll_fn, pin::Pin};

use actix_web::{body::MessageBody, web};
use bytes::Bytes;
use inference_gateway::auth::{ApiKeyEntry, AuthConfig, Role};
use inference_gateway::config::{GatewayConfig, PromptConfig};
use inference_gateway::server::AppState;

pub const ADMIN_KEY: &str = "sk-admin";
pub const USER_KEY: &str = "sk-user";
pub const PENDING_KEY: &str = "sk-pending";

pub fn keyed_auth() -> AuthConfig {
    AuthConfig {
        api_keys: vec![
            ApiKeyEntry::new("admin-1", ADMIN_KEY, Role::Admin),
            ApiKeyEntry::new("user-1", USER_KEY, Role::User),
            ApiKeyEntry::new("pending-1", PENDING_KEY, Role::Pending),
        ],
    }
}

/// Gateway state with API keys enabled, pointed at `upstream_base_url`.
pub fn gateway_state(upstream_base_url: &str, prompt: PromptConfig) -> web::Data<AppState> {
    let config = GatewayConfig {
        upstream_base_url: upstream_base_url.to_string(),
        prompt,
        auth: keyed_auth(),
        request_timeout_secs: Some(10),
        ..Default::default()
    };
    web::Data::new(AppState::from_config(&config).unwrap())
}

pub fn bearer(key: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {}", key))
}

/// Reads the next frame of a streaming response body.
pub async fn next_chunk<B>(body: &mut B) -> Option<Bytes>
where
    B: MessageBody + Unpin,
    B::Error: std::fmt::Debug,
{
    try_next_chunk(body).await.map(|chunk| chunk.unwrap())
}

/// Like [`next_chunk`], but hands back body errors instead of panicking.
pub async fn try_next_chunk<B>(body: &mut B) -> Option<Result<Bytes, B::Error>>
where
    B: MessageBody + Unpin,
{
    poll_fn(|cx| Pin::new(&mut *body).poll_next(cx)).await
}
