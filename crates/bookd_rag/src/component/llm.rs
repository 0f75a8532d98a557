//! LLM clients behind one trait.
//!
//! [`Llm::generate`] blocks until the full answer is available;
//! [`Llm::generate_stream`] hands back a [`TokenStream`], a forward-only
//! iterator of text fragments. Dropping the stream stops the producer, which
//! is the cancellation story for long generations. Client failures surface
//! as errors, never as empty strings.

use std::sync::mpsc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
        }
    }
}

pub trait Llm {
    fn generate(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<String>;

    /// Clients without token-level access fall back to one fragment
    /// containing the whole answer; the stream contract still holds.
    fn generate_stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<TokenStream> {
        let text = self.generate(system_prompt, user_prompt, opts)?;
        Ok(TokenStream::once(text))
    }

    fn model_name(&self) -> &str;
}

/// Lazy, non-restartable sequence of generated text fragments.
pub struct TokenStream {
    rx: mpsc::Receiver<Result<String>>,
}

impl TokenStream {
    pub fn from_channel(rx: mpsc::Receiver<Result<String>>) -> Self {
        Self { rx }
    }

    pub fn once(text: String) -> Self {
        let (tx, rx) = mpsc::channel();
        let _ = tx.send(Ok(text));
        Self { rx }
    }

    /// Drain the stream into one string, stopping at the first error.
    pub fn collect_text(self) -> Result<String> {
        let mut out = String::new();
        for fragment in self {
            out.push_str(&fragment?);
        }
        Ok(out)
    }
}

impl Iterator for TokenStream {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.rx.recv().ok()
    }
}

/// Scripted client for pipeline tests and the server's mock mode. Pops one
/// canned answer per call; an exhausted script replays the fallback.
#[derive(Debug, Default)]
pub struct MockLlm {
    responses: std::sync::Mutex<std::collections::VecDeque<String>>,
    fallback: String,
    fail_with: Option<String>,
}

impl MockLlm {
    pub fn with_responses(responses: &[&str]) -> Self {
        Self {
            responses: std::sync::Mutex::new(
                responses.iter().map(|s| s.to_string()).collect(),
            ),
            fallback: "mock answer".to_string(),
            ..Default::default()
        }
    }

    pub fn always(answer: &str) -> Self {
        Self {
            fallback: answer.to_string(),
            ..Default::default()
        }
    }

    /// Every call fails, for exercising error propagation.
    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Default::default()
        }
    }
}

impl Llm for MockLlm {
    fn generate(&self, _system: &str, _user: &str, _opts: &GenerateOptions) -> Result<String> {
        if let Some(message) = &self.fail_with {
            anyhow::bail!("{message}");
        }
        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        Ok(responses.pop_front().unwrap_or_else(|| self.fallback.clone()))
    }

    fn generate_stream(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        opts: &GenerateOptions,
    ) -> Result<TokenStream> {
        let text = self.generate(system_prompt, user_prompt, opts)?;
        let (tx, rx) = mpsc::channel();
        for word in text.split_inclusive(' ') {
            let _ = tx.send(Ok(word.to_string()));
        }
        Ok(TokenStream::from_channel(rx))
    }

    fn model_name(&self) -> &str {
        "mock"
    }
}

#[cfg(not(target_os = "android"))]
pub use local::LocalLlm;

#[cfg(not(target_os = "android"))]
mod local {
    use std::num::NonZeroU32;
    use std::path::PathBuf;
    use std::sync::{mpsc, Arc};
    use std::time::Duration;

    use anyhow::{anyhow, Context, Result};
    use hf_hub::api::sync::ApiBuilder;
    use llama_cpp_2::context::params::LlamaContextParams;
    use llama_cpp_2::context::LlamaContext;
    use llama_cpp_2::ggml_time_us;
    use llama_cpp_2::llama_backend::LlamaBackend;
    use llama_cpp_2::llama_batch::LlamaBatch;
    use llama_cpp_2::model::params::LlamaModelParams;
    use llama_cpp_2::model::{AddBos, LlamaChatMessage, LlamaModel, Special};
    use llama_cpp_2::sampling::LlamaSampler;
    use llama_cpp_2::token::LlamaToken;
    use tracing::info;

    use super::{GenerateOptions, Llm, TokenStream};

    /// `<hf repo>~<gguf filename>`, resolvable through the hub.
    pub const DEFAULT_MODEL: &str =
        "Qwen/Qwen2.5-1.5B-Instruct-GGUF~qwen2.5-1.5b-instruct-q8_0.gguf";

    const CONTEXT_LENGTH: NonZeroU32 = unsafe { NonZeroU32::new_unchecked(32768) };

    fn download_from_hf(model_name: &str) -> Result<PathBuf> {
        let (repo_model, gguf_filename) = model_name
            .split_once('~')
            .ok_or(anyhow!("not a valid hf repo"))?;
        ApiBuilder::new()
            .with_progress(true)
            .build()
            .with_context(|| "unable to create hf api")?
            .model(repo_model.to_string())
            .get(gguf_filename)
            .with_context(|| "unable to download model")
    }

    struct ModelBundle {
        backend: LlamaBackend,
        model: LlamaModel,
        model_name: String,
    }

    impl ModelBundle {
        fn create_ctx(&self) -> Result<LlamaContext<'_>> {
            let ctx_params = LlamaContextParams::default().with_n_ctx(Some(CONTEXT_LENGTH));
            self.model
                .new_context(&self.backend, ctx_params)
                .with_context(|| "create llama.cpp context failed")
        }

        fn render_chat(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
            let template = self.model.get_chat_template()?;
            let messages = vec![
                LlamaChatMessage::new("system".to_string(), system_prompt.to_string())?,
                LlamaChatMessage::new("user".to_string(), user_prompt.to_string())?,
            ];
            Ok(self.model.apply_chat_template(&template, &messages, true)?)
        }

        fn tokenize(&self, prompt: &str) -> Result<Vec<LlamaToken>> {
            self.model
                .str_to_token(prompt, AddBos::Always)
                .with_context(|| "tokenize failed")
        }
    }

    /// Local llama.cpp model. The gguf file is fetched from the hub once and
    /// cached; each generation gets a fresh context.
    pub struct LocalLlm {
        bundle: Arc<ModelBundle>,
    }

    impl LocalLlm {
        pub fn new(model_name: Option<String>) -> Result<LocalLlm> {
            let model_name = model_name.unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let backend =
                LlamaBackend::init().with_context(|| "initialize llama context failed.")?;
            let model_params = LlamaModelParams::default();
            let model_file = download_from_hf(&model_name)?;
            let model = LlamaModel::load_from_file(&backend, model_file, &model_params)
                .with_context(|| "load llama.cpp model failed.")?;
            Ok(LocalLlm {
                bundle: Arc::new(ModelBundle {
                    backend,
                    model,
                    model_name,
                }),
            })
        }
    }

    fn make_sampler(opts: &GenerateOptions) -> LlamaSampler {
        LlamaSampler::chain_simple([
            LlamaSampler::temp(opts.temperature),
            LlamaSampler::top_p(0.95, 1),
            LlamaSampler::greedy(),
        ])
    }

    /// Feed the prompt, then sample until end-of-generation or the token
    /// budget, handing each decoded piece to `emit`. `emit` returning false
    /// stops generation early.
    fn decode_loop(
        bundle: &ModelBundle,
        ctx: &mut LlamaContext,
        tokens_list: &[LlamaToken],
        opts: &GenerateOptions,
        emit: &mut dyn FnMut(&[u8]) -> bool,
    ) -> Result<()> {
        let mut batch = LlamaBatch::new(tokens_list.len().max(512), 1);
        let last_idx = (tokens_list.len() - 1) as i32;
        for (i, token) in (0_i32..).zip(tokens_list.iter()) {
            let is_last = i == last_idx;
            batch.add(*token, i, &[0], is_last)?;
        }
        ctx.decode(&mut batch)
            .with_context(|| "llama decode failed")?;

        let t_main_start = ggml_time_us();
        let mut sampler = make_sampler(opts);
        let mut n_cur = batch.n_tokens();
        let mut n_decode = 0;
        let budget = n_cur + opts.max_tokens as i32;

        while n_cur <= budget {
            let token = sampler.sample(ctx, batch.n_tokens() - 1);
            sampler.accept(token);

            if bundle.model.is_eog_token(token) {
                break;
            }

            // one token is not necessarily a valid utf8 string, so emit raw
            // bytes and let the caller reassemble
            let bytes = bundle
                .model
                .token_to_bytes(token, Special::Tokenize)
                .with_context(|| "detokenize failed")?;
            if !emit(&bytes) {
                break;
            }

            batch.clear();
            batch.add(token, n_cur, &[0], true)?;
            ctx.decode(&mut batch)?;
            n_cur += 1;
            n_decode += 1;
        }

        let duration = Duration::from_micros((ggml_time_us() - t_main_start) as u64);
        info!(
            "decoded {} tokens in {:.2} s, speed {:.2} t/s",
            n_decode,
            duration.as_secs_f32(),
            n_decode as f32 / duration.as_secs_f32()
        );
        Ok(())
    }

    /// Buffers raw token bytes and releases only complete utf8 prefixes.
    struct Utf8Assembler {
        pending: Vec<u8>,
    }

    impl Utf8Assembler {
        fn new() -> Self {
            Self { pending: Vec::new() }
        }

        fn push(&mut self, bytes: &[u8]) -> Option<String> {
            self.pending.extend_from_slice(bytes);
            let valid_up_to = match std::str::from_utf8(&self.pending) {
                Ok(_) => self.pending.len(),
                Err(err) => err.valid_up_to(),
            };
            if valid_up_to == 0 {
                return None;
            }
            let rest = self.pending.split_off(valid_up_to);
            let piece = String::from_utf8(std::mem::replace(&mut self.pending, rest)).ok()?;
            Some(piece)
        }
    }

    impl Llm for LocalLlm {
        fn generate(
            &self,
            system_prompt: &str,
            user_prompt: &str,
            opts: &GenerateOptions,
        ) -> Result<String> {
            let prompt = self.bundle.render_chat(system_prompt, user_prompt)?;
            let tokens = self.bundle.tokenize(&prompt)?;
            let mut ctx = self.bundle.create_ctx()?;
            let mut answer_bytes = Vec::new();
            decode_loop(&self.bundle, &mut ctx, &tokens, opts, &mut |bytes| {
                answer_bytes.extend_from_slice(bytes);
                true
            })?;
            String::from_utf8(answer_bytes).with_context(|| "model produced invalid utf8")
        }

        fn generate_stream(
            &self,
            system_prompt: &str,
            user_prompt: &str,
            opts: &GenerateOptions,
        ) -> Result<TokenStream> {
            let prompt = self.bundle.render_chat(system_prompt, user_prompt)?;
            let tokens = self.bundle.tokenize(&prompt)?;
            let bundle = Arc::clone(&self.bundle);
            let opts = opts.clone();
            let (tx, rx) = mpsc::sync_channel(8);

            std::thread::spawn(move || {
                let mut ctx = match bundle.create_ctx() {
                    Ok(ctx) => ctx,
                    Err(err) => {
                        let _ = tx.send(Err(err));
                        return;
                    }
                };
                let mut assembler = Utf8Assembler::new();
                let result = decode_loop(&bundle, &mut ctx, &tokens, &opts, &mut |bytes| {
                    match assembler.push(bytes) {
                        // receiver gone: stop decoding, release the context
                        Some(piece) => tx.send(Ok(piece)).is_ok(),
                        None => true,
                    }
                });
                if let Err(err) = result {
                    let _ = tx.send(Err(err));
                }
            });

            Ok(TokenStream::from_channel(rx))
        }

        fn model_name(&self) -> &str {
            &self.bundle.model_name
        }
    }

    #[test]
    #[ignore = "downloads a gguf model and runs llama.cpp inference"]
    fn test_local_generate() {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
        let llm = LocalLlm::new(None).unwrap();
        let answer = llm
            .generate(
                "You are a terse assistant.",
                "How many r's are there in the word strawberry?",
                &GenerateOptions::default(),
            )
            .unwrap();
        println!("{answer}");
        assert!(!answer.is_empty());
    }

    #[test]
    #[ignore = "downloads a gguf model and runs llama.cpp inference"]
    fn test_local_stream_can_be_abandoned() {
        let llm = LocalLlm::new(None).unwrap();
        let mut stream = llm
            .generate_stream(
                "You are a verbose assistant.",
                "Tell me everything about the ocean.",
                &GenerateOptions::default(),
            )
            .unwrap();
        let first = stream.next();
        assert!(first.is_some());
        drop(stream);
    }
}
