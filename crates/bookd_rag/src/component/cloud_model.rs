//! OpenAI-protocol chat client for hosted models.
//!
//! Useful when the machine is too small for local inference; any endpoint
//! speaking the OpenAI chat API works (api key + base url).

use anyhow::{anyhow, Result};
use openai_api_rust::{
    chat::{ChatApi, ChatBody},
    Auth, Message, OpenAI, Role,
};

use super::llm::{GenerateOptions, Llm};

const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/";
const DEFAULT_MODEL: &str = "gpt-4o-mini";

pub struct CloudLlm {
    openai: OpenAI,
    model: String,
}

impl CloudLlm {
    pub fn new(api_key: &str, endpoint: Option<&str>, model: Option<&str>) -> CloudLlm {
        let auth = Auth::new(api_key);
        let openai = OpenAI::new(auth, endpoint.unwrap_or(DEFAULT_ENDPOINT));
        Self {
            openai,
            model: model.unwrap_or(DEFAULT_MODEL).to_string(),
        }
    }
}

impl Llm for CloudLlm {
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<String> {
        let body = ChatBody {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: Role::System,
                    content: system_prompt.to_string(),
                },
                Message {
                    role: Role::User,
                    content: user_prompt.to_string(),
                },
            ],
            temperature: Some(opts.temperature),
            top_p: None,
            n: None,
            stream: None,
            stop: None,
            max_tokens: Some(opts.max_tokens as i32),
            presence_penalty: None,
            frequency_penalty: None,
            logit_bias: None,
            user: None,
        };

        let resp = self
            .openai
            .chat_completion_create(&body)
            .map_err(|err| anyhow!("chat completion failed: {err:?}"))?;
        let choice = resp
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("chat completion returned no choices"))?;
        let message = choice
            .message
            .ok_or_else(|| anyhow!("chat completion choice had no message"))?;
        Ok(message.content)
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
