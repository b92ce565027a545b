use tch::{Device, Kind, Tensor};

use crate::error::Result;

/// Caption attached to one training video. Some datasets carry several.
#[derive(Debug, Clone, PartialEq)]
pub enum Caption {
    Single(String),
    Multiple(Vec<String>),
}

impl From<&str> for Caption {
    fn from(s: &str) -> Self {
        Caption::Single(s.to_string())
    }
}

impl From<String> for Caption {
    fn from(s: String) -> Self {
        Caption::Single(s)
    }
}

/// Frozen prompt encoder, `captions -> (batch, tokens, dim)`.
pub trait TextEncoder {
    fn encode(&self, captions: &[String]) -> anyhow::Result<Tensor>;
}

/// One caption per sample. During training a sample with several captions
/// contributes one drawn from the libtorch generator, otherwise the first.
pub fn select_captions(captions: &[Caption], is_train: bool) -> Vec<String> {
    captions
        .iter()
        .map(|caption| match caption {
            Caption::Single(text) => text.clone(),
            Caption::Multiple(texts) if texts.is_empty() => String::new(),
            Caption::Multiple(texts) if is_train => {
                let i = Tensor::randint(texts.len() as i64, [1], (Kind::Int64, Device::Cpu))
                    .int64_value(&[0]);
                texts[i as usize].clone()
            }
            Caption::Multiple(texts) => texts[0].clone(),
        })
        .collect()
}

/// Prompt embeddings computed without gradient tracking.
pub fn encode_prompts(encoder: &dyn TextEncoder, prompts: &[String]) -> Result<Tensor> {
    let embeds = tch::no_grad(|| encoder.encode(prompts))?;
    Ok(embeds)
}

/// Embeddings of `batch` empty prompts, used as the unconditional branch of guidance.
pub fn unconditional_embeddings(encoder: &dyn TextEncoder, batch: usize) -> Result<Tensor> {
    encode_prompts(encoder, &vec![String::new(); batch])
}
