//! Sentence embedding with a candle BERT model.
//!
//! Defaults to `sentence-transformers/all-MiniLM-L6-v2` (384 dimensions)
//! fetched through hf-hub. Embeddings are mean-pooled over non-padding
//! tokens and L2-normalized, so batched and single-sentence encoding agree
//! up to floating point tolerance.

use anyhow::{Error as E, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::bert::{BertModel, Config, HiddenAct, DTYPE};
use hf_hub::{api::sync::Api, Repo, RepoType};
use tokenizers::{PaddingParams, Tokenizer};
use tracing::info;

use super::operation::Chunk;

pub const DEFAULT_MODEL: &str = "sentence-transformers/all-MiniLM-L6-v2";
pub const DEFAULT_REVISION: &str = "refs/pr/21";

pub struct Embedder {
    model: BertModel,
    tokenizer: Tokenizer,
    dimension: usize,
    model_id: String,
}

impl std::fmt::Debug for Embedder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Embedder")
            .field("model_id", &self.model_id)
            .field("dimension", &self.dimension)
            .finish()
    }
}

fn normalize_l2(v: &Tensor) -> Result<Tensor> {
    Ok(v.broadcast_div(&v.sqr()?.sum_all()?.sqrt()?)?)
}

fn normalize_l2_rows(v: &Tensor) -> Result<Tensor> {
    Ok(v.broadcast_div(&v.sqr()?.sum_keepdim(1)?.sqrt()?)?)
}

impl Embedder {
    pub fn new(model_id: Option<String>, revision: Option<String>) -> Result<Self> {
        let device = Device::Cpu;
        let (model_id, revision) = match (model_id, revision) {
            (Some(model_id), Some(revision)) => (model_id, revision),
            (Some(model_id), None) => (model_id, "main".to_string()),
            (None, Some(revision)) => (DEFAULT_MODEL.to_string(), revision),
            (None, None) => (DEFAULT_MODEL.to_string(), DEFAULT_REVISION.to_string()),
        };

        let repo = Repo::with_revision(model_id.clone(), RepoType::Model, revision);
        let (config_filename, tokenizer_filename, weights_filename) = {
            let api = Api::new()?;
            let api = api.repo(repo);
            let config = api.get("config.json")?;
            let tokenizer = api.get("tokenizer.json")?;
            let weights = api.get("model.safetensors")?;
            (config, tokenizer, weights)
        };
        let config = std::fs::read_to_string(config_filename)?;
        let mut config: Config = serde_json::from_str(&config)?;
        config.hidden_act = HiddenAct::GeluApproximate;
        let dimension = config.hidden_size;

        let tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(E::msg)?;

        let vb =
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)? };
        let model = BertModel::load(vb, &config)?;
        info!("loaded embedding model {model_id} ({dimension} dimensions)");
        Ok(Self {
            model,
            tokenizer,
            dimension,
            model_id,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Embed one text. The empty string embeds fine: the tokenizer still
    /// emits its special tokens, so pooling never divides by zero.
    pub fn embed_text(&mut self, text: &str) -> Result<Vec<f32>> {
        let device = &self.model.device;
        let tokenizer = self
            .tokenizer
            .with_padding(None)
            .with_truncation(None)
            .map_err(E::msg)?;
        let tokens = tokenizer
            .encode(text, true)
            .map_err(E::msg)?
            .get_ids()
            .to_vec();
        let token_ids = Tensor::new(&tokens[..], device)?.unsqueeze(0)?;
        let token_type_ids = token_ids.zeros_like()?;
        let embedding = self
            .model
            .forward(&token_ids, &token_type_ids, None)
            .map_err(E::msg)?;
        let pooled = (embedding.sum((0, 1))? / (tokens.len() as f64))?;
        let normalized = normalize_l2(&pooled)?;
        Ok(normalized.to_vec1::<f32>()?)
    }

    /// Embed many texts, `batch_size` at a time. Batching only changes
    /// throughput; pooling ignores padding positions so the result matches
    /// repeated [`Self::embed_text`] calls within floating point tolerance.
    pub fn embed_batch(
        &mut self,
        texts: &[String],
        batch_size: usize,
        show_progress: bool,
    ) -> Result<Vec<Vec<f32>>> {
        let batch_size = batch_size.max(1);
        let mut out = Vec::with_capacity(texts.len());
        for (batch_index, batch) in texts.chunks(batch_size).enumerate() {
            out.extend(self.encode_batch(batch)?);
            if show_progress {
                info!(
                    "embedded {}/{} texts",
                    (batch_index * batch_size + batch.len()).min(texts.len()),
                    texts.len()
                );
            }
        }
        Ok(out)
    }

    /// Populate `embedding` on each chunk in place.
    pub fn embed_chunks(&mut self, chunks: &mut [Chunk], batch_size: usize) -> Result<()> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let embeddings = self.embed_batch(&texts, batch_size, false)?;
        for (chunk, embedding) in chunks.iter_mut().zip(embeddings) {
            chunk.embedding = Some(embedding);
        }
        Ok(())
    }

    fn encode_batch(&mut self, sentences: &[String]) -> Result<Vec<Vec<f32>>> {
        let device = &self.model.device;

        if let Some(pp) = self.tokenizer.get_padding_mut() {
            pp.strategy = tokenizers::PaddingStrategy::BatchLongest;
        } else {
            let pp = PaddingParams {
                strategy: tokenizers::PaddingStrategy::BatchLongest,
                ..Default::default()
            };
            self.tokenizer.with_padding(Some(pp));
        }

        let tokens = self
            .tokenizer
            .encode_batch(sentences.to_vec(), true)
            .map_err(E::msg)?;
        let token_ids = tokens
            .iter()
            .map(|encoding| {
                let ids = encoding.get_ids().to_vec();
                Ok(Tensor::new(ids.as_slice(), device)?)
            })
            .collect::<Result<Vec<_>>>()?;
        let attention_mask = tokens
            .iter()
            .map(|encoding| {
                let mask = encoding.get_attention_mask().to_vec();
                Ok(Tensor::new(mask.as_slice(), device)?)
            })
            .collect::<Result<Vec<_>>>()?;

        let token_ids = Tensor::stack(&token_ids, 0)?;
        let attention_mask = Tensor::stack(&attention_mask, 0)?;
        let token_type_ids = token_ids.zeros_like()?;

        let embeddings = self
            .model
            .forward(&token_ids, &token_type_ids, Some(&attention_mask))
            .map_err(E::msg)?;

        // Mean-pool over real tokens only; padded positions carry no weight.
        let mask = attention_mask.to_dtype(DType::F32)?.unsqueeze(2)?;
        let summed = embeddings.broadcast_mul(&mask)?.sum(1)?;
        let counts = mask.sum(1)?;
        let pooled = summed.broadcast_div(&counts)?;
        let normalized = normalize_l2_rows(&pooled)?;

        let mut batch_embeddings = Vec::with_capacity(sentences.len());
        for i in 0..sentences.len() {
            batch_embeddings.push(normalized.get(i)?.to_vec1::<f32>()?);
        }
        Ok(batch_embeddings)
    }
}
