use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::AppConfig;

/// Produces a reply draft in the persona's voice. Opaque to the engine:
/// a failure here never blocks ingestion; the caller substitutes the
/// canned acknowledgement.
#[async_trait]
pub trait DraftComposer: Send + Sync {
    async fn compose(
        &self,
        persona_id: &str,
        commenter_name: &str,
        comment_text: &str,
        fan_context: Option<&str>,
    ) -> Result<String>;
}

/// Keyed lookup into the externally-owned fan memory. Consumed, never
/// written, by the interaction engine.
#[async_trait]
pub trait FanMemory: Send + Sync {
    async fn context(&self, persona_id: &str, fan_id: &str) -> Option<String>;
}

/// Default when no fan memory backend is wired in.
pub struct NoFanMemory;

#[async_trait]
impl FanMemory for NoFanMemory {
    async fn context(&self, _persona_id: &str, _fan_id: &str) -> Option<String> {
        None
    }
}

/// Safe acknowledgement used whenever generation is unavailable or fails.
pub fn canned_reply(commenter_name: &str) -> String {
    format!("謝謝 {commenter_name} 的留言！😊 很高興和你互動，期待你的下次留言！")
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageOwned,
}

#[derive(Deserialize)]
struct ChatMessageOwned {
    content: String,
}

/// Chat-completion backed composer.
pub struct ChatCompletionComposer {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl ChatCompletionComposer {
    /// `None` when no API key is configured; the engine then composes
    /// canned acknowledgements only.
    pub fn from_config(cfg: &AppConfig) -> Option<Self> {
        if cfg.llm_api_key.is_empty() {
            return None;
        }
        Some(Self {
            api_key: cfg.llm_api_key.clone(),
            model: cfg.llm_model.clone(),
            client: reqwest::Client::new(),
        })
    }

    fn build_prompt(
        persona_id: &str,
        commenter_name: &str,
        comment_text: &str,
        fan_context: Option<&str>,
    ) -> String {
        let fan_section = match fan_context {
            Some(ctx) if !ctx.is_empty() => format!("\n粉絲資訊：{ctx}"),
            _ => String::new(),
        };
        format!(
            "你是虛擬網紅「{persona_id}」。{fan_section}\n\
             有一位名叫「{commenter_name}」的粉絲留言：\n「{comment_text}」\n\
             請以符合你個性和語氣的方式撰寫一則回覆。要求：\n\
             - 親切自然，不能太正式或太生硬\n\
             - 不超過 150 字，可加入適當的 emoji\n\
             - 若粉絲資訊中有名稱，可以叫出粉絲名字讓回覆更個人化\n\
             - 只輸出回覆內容本身，不要加任何說明或前言"
        )
    }
}

#[async_trait]
impl DraftComposer for ChatCompletionComposer {
    async fn compose(
        &self,
        persona_id: &str,
        commenter_name: &str,
        comment_text: &str,
        fan_context: Option<&str>,
    ) -> Result<String> {
        let prompt = Self::build_prompt(persona_id, commenter_name, comment_text, fan_context);
        let req = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: &prompt,
            }],
        };
        let res = self
            .client
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&req)
            .send()
            .await?;
        if !res.status().is_success() {
            return Err(anyhow!(
                "chat completion failed: {}",
                res.text().await.unwrap_or_default()
            ));
        }
        let parsed: ChatResponse = res.json().await?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| anyhow!("chat completion returned no choices"))
    }
}

/// Composer used when no chat backend is configured: every draft is the
/// canned acknowledgement, personalised with the commenter's name.
pub struct CannedComposer;

#[async_trait]
impl DraftComposer for CannedComposer {
    async fn compose(
        &self,
        _persona_id: &str,
        commenter_name: &str,
        _comment_text: &str,
        _fan_context: Option<&str>,
    ) -> Result<String> {
        Ok(canned_reply(commenter_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canned_reply_addresses_the_commenter() {
        let reply = canned_reply("小華");
        assert!(reply.contains("小華"));
    }

    #[test]
    fn prompt_includes_fan_context_only_when_present() {
        let with = ChatCompletionComposer::build_prompt("p1", "小華", "你好", Some("老粉絲"));
        assert!(with.contains("粉絲資訊：老粉絲"));
        let without = ChatCompletionComposer::build_prompt("p1", "小華", "你好", None);
        assert!(!without.contains("粉絲資訊"));
    }

    #[tokio::test]
    async fn canned_composer_never_fails() {
        let composed = CannedComposer
            .compose("p1", "小華", "anything", None)
            .await
            .unwrap();
        assert!(composed.contains("小華"));
    }
}
