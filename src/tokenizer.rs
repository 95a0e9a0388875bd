use log::debug;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

use crate::config::TokenizerMode;

/// Characters per token assumed for CJK ideographs by the heuristic.
const CJK_CHARS_PER_TOKEN: f64 = 1.5;
/// Characters per token assumed for everything else.
const OTHER_CHARS_PER_TOKEN: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    // GPT-4, GPT-3.5-turbo, and the default for self-hosted models
    Cl100k,
    // GPT-4o models
    O200k,
}

impl Encoding {
    pub fn for_model(model: &str) -> Self {
        if model.to_lowercase().contains("gpt-4o") {
            Encoding::O200k
        } else {
            Encoding::Cl100k
        }
    }

    fn load(self) -> anyhow::Result<CoreBPE> {
        match self {
            Encoding::Cl100k => cl100k_base(),
            Encoding::O200k => o200k_base(),
        }
    }
}

/// Approximates token counts for prompts and streamed output.
///
/// Uses a BPE encoding when one could be loaded for the model and a
/// character-class heuristic otherwise. The estimator is cheap to clone and
/// is shared by every in-flight request.
#[derive(Clone)]
pub struct TokenEstimator {
    encoder: Option<Arc<CoreBPE>>,
    encoding: Option<Encoding>,
}

impl TokenEstimator {
    pub fn new(model: &str, mode: TokenizerMode) -> Self {
        if mode == TokenizerMode::Heuristic {
            debug!("Token estimation forced to character heuristic");
            return Self::heuristic();
        }

        let encoding = Encoding::for_model(model);
        match encoding.load() {
            Ok(encoder) => Self {
                encoder: Some(Arc::new(encoder)),
                encoding: Some(encoding),
            },
            Err(e) => {
                debug!(
                    "Failed to load {:?} encoding for {}: {}, falling back to estimation",
                    encoding, model, e
                );
                Self::heuristic()
            }
        }
    }

    pub fn heuristic() -> Self {
        Self {
            encoder: None,
            encoding: None,
        }
    }

    pub fn encoding(&self) -> Option<Encoding> {
        self.encoding
    }

    pub fn estimate(&self, text: &str) -> u64 {
        if text.is_empty() {
            return 0;
        }

        match &self.encoder {
            // Raw text only; chat framing tokens added by the server are not counted.
            Some(encoder) => encoder.encode_with_special_tokens(text).len() as u64,
            None => heuristic_estimate(text),
        }
    }
}

pub fn is_cjk(c: char) -> bool {
    ('\u{4e00}'..='\u{9fff}').contains(&c)
}

/// Character-class estimate, floored and never below one for non-empty text.
pub fn heuristic_estimate(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }

    let (cjk, other) = text.chars().fold((0u64, 0u64), |(cjk, other), c| {
        if is_cjk(c) {
            (cjk + 1, other)
        } else {
            (cjk, other + 1)
        }
    });

    let estimate = cjk as f64 / CJK_CHARS_PER_TOKEN + other as f64 / OTHER_CHARS_PER_TOKEN;
    (estimate.floor() as u64).max(1)
}
