//! Best-effort rewriting of chat payloads before they are forwarded upstream.
//!
//! Two steps run in a fixed order: a system instruction is inserted as the
//! first message, then every user message gets a fixed prefix. The prefix
//! step only touches `user` entries, so swapping the order would not change
//! the result.

use bytes::Bytes;
use serde_json::{Map, Value};
use tracing::debug;

use crate::config::PromptConfig;

/// Outcome of [`BodyTransformer::transform`]. Both variants carry bytes that
/// are safe to forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rewrite {
    /// The payload was a chat payload and has been re-serialized.
    Rewritten(Bytes),
    /// The payload could not be interpreted; the original bytes are kept.
    Unchanged(Bytes),
}

impl Rewrite {
    pub fn is_rewritten(&self) -> bool {
        matches!(self, Rewrite::Rewritten(_))
    }

    pub fn into_bytes(self) -> Bytes {
        match self {
            Rewrite::Rewritten(bytes) | Rewrite::Unchanged(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BodyTransformer {
    system_prompt: Option<String>,
    user_prefix: Option<String>,
}

impl BodyTransformer {
    pub fn new(system_prompt: Option<String>, user_prefix: Option<String>) -> Self {
        Self {
            system_prompt,
            user_prefix,
        }
    }

    pub fn from_config(config: &PromptConfig) -> Self {
        Self::new(config.system_prompt.clone(), config.user_prefix.clone())
    }

    pub fn is_noop(&self) -> bool {
        self.system_prompt.is_none() && self.user_prefix.is_none()
    }

    pub fn transform(&self, raw: Bytes) -> Rewrite {
        if self.is_noop() {
            return Rewrite::Unchanged(raw);
        }

        let Some(mut payload) = parse_chat_payload(&raw) else {
            debug!("Payload is not a chat payload, forwarding unchanged");
            return Rewrite::Unchanged(raw);
        };

        if let Some(system_prompt) = &self.system_prompt {
            insert_system_prompt(&mut payload, system_prompt);
        }
        if let Some(prefix) = &self.user_prefix {
            prefix_user_messages(&mut payload, prefix);
        }

        match serde_json::to_vec(&Value::Object(payload)) {
            Ok(encoded) => Rewrite::Rewritten(Bytes::from(encoded)),
            Err(e) => {
                debug!("Failed to re-encode rewritten payload: {}", e);
                Rewrite::Unchanged(raw)
            }
        }
    }
}

/// Decodes `raw` as a UTF-8 JSON object carrying a `messages` array.
fn parse_chat_payload(raw: &[u8]) -> Option<Map<String, Value>> {
    let text = std::str::from_utf8(raw).ok()?;
    match serde_json::from_str::<Value>(text).ok()? {
        Value::Object(map) if map.get("messages").is_some_and(Value::is_array) => Some(map),
        _ => None,
    }
}

pub fn insert_system_prompt(payload: &mut Map<String, Value>, content: &str) {
    if let Some(Value::Array(messages)) = payload.get_mut("messages") {
        let mut message = Map::new();
        message.insert("role".to_string(), Value::from("system"));
        message.insert("content".to_string(), Value::from(content));
        messages.insert(0, Value::Object(message));
    }
}

/// Prepends `prefix` to the text content of every user message. Messages
/// whose content is not a plain string are left alone.
pub fn prefix_user_messages(payload: &mut Map<String, Value>, prefix: &str) {
    let Some(Value::Array(messages)) = payload.get_mut("messages") else {
        return;
    };

    for message in messages.iter_mut().filter_map(Value::as_object_mut) {
        if message.get("role").and_then(Value::as_str) != Some("user") {
            continue;
        }
        if let Some(Value::String(content)) = message.get_mut("content") {
            content.insert_str(0, prefix);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn transformer() -> BodyTransformer {
        BodyTransformer::new(Some("S".to_string()), Some("P".to_string()))
    }

    fn decode(rewrite: Rewrite) -> Value {
        serde_json::from_slice(&rewrite.into_bytes()).unwrap()
    }

    #[test]
    fn test_system_prompt_and_prefix() {
        let raw = Bytes::from_static(br#"{"messages":[{"role":"user","content":"hi"}]}"#);
        let rewrite = transformer().transform(raw);
        assert!(rewrite.is_rewritten());

        assert_eq!(
            decode(rewrite)["messages"],
            json!([
                {"role": "system", "content": "S"},
                {"role": "user", "content": "Phi"}
            ])
        );
    }

    #[test]
    fn test_non_json_passes_through() {
        let raw = Bytes::from_static(b"Not a JSON");
        assert_eq!(transformer().transform(raw.clone()), Rewrite::Unchanged(raw));
    }

    #[test]
    fn test_invalid_utf8_passes_through() {
        let raw = Bytes::from_static(&[0xff, 0xfe, b'{', b'}']);
        assert_eq!(transformer().transform(raw.clone()), Rewrite::Unchanged(raw));
    }

    #[test]
    fn test_payload_without_messages_is_byte_identical() {
        let raw = Bytes::from_static(br#"{"model": "llama2",  "prompt": "why"}"#);
        assert_eq!(transformer().transform(raw.clone()), Rewrite::Unchanged(raw));
    }

    #[test]
    fn test_messages_not_an_array() {
        let raw = Bytes::from_static(br#"{"messages":"hello"}"#);
        assert_eq!(transformer().transform(raw.clone()), Rewrite::Unchanged(raw));
    }

    #[test]
    fn test_only_user_messages_are_prefixed() {
        let raw = Bytes::from(
            json!({
                "model": "zephyr",
                "messages": [
                    {"role": "user", "content": "Help me"},
                    {"role": "assistant", "content": ""},
                    {"role": "user", "content": "again"}
                ],
                "options": {}
            })
            .to_string(),
        );

        let payload = decode(transformer().transform(raw));
        assert_eq!(payload["model"], "zephyr");
        assert_eq!(payload["options"], json!({}));
        assert_eq!(
            payload["messages"],
            json!([
                {"role": "system", "content": "S"},
                {"role": "user", "content": "PHelp me"},
                {"role": "assistant", "content": ""},
                {"role": "user", "content": "Pagain"}
            ])
        );
    }

    #[test]
    fn test_non_string_user_content_is_left_alone() {
        let raw = Bytes::from(
            json!({"messages": [{"role": "user", "content": [{"type": "text", "text": "x"}]}]})
                .to_string(),
        );

        let payload = decode(transformer().transform(raw));
        assert_eq!(payload["messages"][0]["role"], "system");
        assert_eq!(
            payload["messages"][1]["content"],
            json!([{"type": "text", "text": "x"}])
        );
    }

    #[test]
    fn test_empty_messages_gets_system_prompt() {
        let raw = Bytes::from_static(br#"{"messages":[]}"#);
        let payload = decode(transformer().transform(raw));
        assert_eq!(payload["messages"], json!([{"role": "system", "content": "S"}]));
    }

    #[test]
    fn test_noop_transformer_never_reencodes() {
        let raw = Bytes::from_static(br#"{"messages": [ {"role":"user","content":"hi"} ]}"#);
        let rewrite = BodyTransformer::default().transform(raw.clone());
        assert_eq!(rewrite, Rewrite::Unchanged(raw));
    }

    #[test]
    fn test_prefix_only() {
        let transformer = BodyTransformer::new(None, Some(">> ".to_string()));
        let raw = Bytes::from_static(br#"{"messages":[{"role":"user","content":"hi"}]}"#);
        let payload = decode(transformer.transform(raw));
        assert_eq!(
            payload["messages"],
            json!([{"role": "user", "content": ">> hi"}])
        );
    }

    #[test]
    fn test_key_order_is_preserved() {
        let raw = Bytes::from_static(br#"{"model":"m","messages":[],"stream":false}"#);
        let rewritten = transformer().transform(raw).into_bytes();
        let text = std::str::from_utf8(&rewritten).unwrap();
        let model = text.find("\"model\"").unwrap();
        let messages = text.find("\"messages\"").unwrap();
        let stream = text.find("\"stream\"").unwrap();
        assert!(model < messages && messages < stream);
    }
}
