use anyhow::{Result, anyhow};
use log::{debug, warn};
use std::path::Path;
use std::sync::Arc;
use tiktoken_rs::{CoreBPE, cl100k_base, o200k_base};

/// Counts prompt and completion tokens when sampling the dataset.
///
/// OpenAI encodings are served by tiktoken; anything else is treated as a
/// Hugging Face tokenizer, either a local `tokenizer.json` or a hub identifier.
#[derive(Clone)]
pub enum Tokenizer {
    Tiktoken(Arc<CoreBPE>),
    HuggingFace(Arc<tokenizers::Tokenizer>),
}

impl Tokenizer {
    pub fn load(name_or_path: &str, trust_remote_code: bool) -> Result<Self> {
        if trust_remote_code {
            warn!("--trust-remote-code has no effect: tokenizers are loaded as data only");
        }

        if let Some(encoder) = Self::tiktoken_for(name_or_path)? {
            debug!("Using tiktoken encoding for {}", name_or_path);
            return Ok(Tokenizer::Tiktoken(Arc::new(encoder)));
        }

        let path = Path::new(name_or_path);
        let tokenizer = if path.exists() {
            let file = if path.is_dir() {
                path.join("tokenizer.json")
            } else {
                path.to_path_buf()
            };
            debug!("Loading tokenizer from {}", file.display());
            tokenizers::Tokenizer::from_file(&file)
                .map_err(|e| anyhow!("failed to load tokenizer from {}: {e}", file.display()))?
        } else {
            debug!("Fetching tokenizer {} from the Hugging Face hub", name_or_path);
            tokenizers::Tokenizer::from_pretrained(name_or_path, None)
                .map_err(|e| anyhow!("failed to load tokenizer {name_or_path}: {e}"))?
        };

        Ok(Tokenizer::HuggingFace(Arc::new(tokenizer)))
    }

    fn tiktoken_for(name: &str) -> Result<Option<CoreBPE>> {
        let lower = name.to_lowercase();
        let encoder = if lower == "o200k_base" || lower.starts_with("gpt-4o") {
            Some(o200k_base()?)
        } else if lower == "cl100k_base" || lower.starts_with("gpt-4") || lower.starts_with("gpt-3.5")
        {
            Some(cl100k_base()?)
        } else {
            None
        };
        Ok(encoder)
    }

    pub fn count_tokens(&self, text: &str) -> Result<usize> {
        match self {
            Tokenizer::Tiktoken(encoder) => Ok(encoder.encode_with_special_tokens(text).len()),
            Tokenizer::HuggingFace(tokenizer) => {
                let encoding = tokenizer
                    .encode(text, true)
                    .map_err(|e| anyhow!("tokenization failed: {e}"))?;
                Ok(encoding.len())
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Tokenizer::Tiktoken(_) => "tiktoken",
            Tokenizer::HuggingFace(_) => "huggingface",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiktoken_names() {
        let tokenizer = Tokenizer::load("cl100k_base", false).unwrap();
        assert_eq!(tokenizer.kind(), "tiktoken");

        let tokenizer = Tokenizer::load("gpt-4o-mini", false).unwrap();
        assert_eq!(tokenizer.kind(), "tiktoken");
    }

    #[test]
    fn test_token_counting() {
        let tokenizer = Tokenizer::load("gpt-3.5-turbo", false).unwrap();

        assert_eq!(tokenizer.count_tokens("").unwrap(), 0);

        let short = tokenizer.count_tokens("Hello, world!").unwrap();
        assert!(short > 0);

        let long = tokenizer
            .count_tokens("Hello, world! Hello, world! Hello, world!")
            .unwrap();
        assert!(long > short);
    }

    #[test]
    fn test_missing_local_tokenizer_file() {
        let dir = tempfile::tempdir().unwrap();
        // A directory without tokenizer.json is a local path, not a hub id.
        let result = Tokenizer::load(dir.path().to_str().unwrap(), false);
        assert!(result.is_err());
    }
}
