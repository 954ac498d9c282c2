use anyhow::{Context, Result, bail};
use log::{debug, info, warn};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::path::Path;

use crate::tokenizer::Tokenizer;

/// Pairs shorter than this many tokens on either side are dropped.
const MIN_SEQUENCE_TOKENS: usize = 4;

/// Upper bound on prompt plus completion tokens for a sampled pair.
const MAX_SEQUENCE_TOKENS: usize = 2048;

/// A pre-sampled chat request.
///
/// `output_len` is the token length of the reference completion and is sent
/// to the server as `max_tokens`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub prompt: String,
    pub prompt_len: usize,
    pub output_len: usize,
}

impl Request {
    pub fn new(prompt: impl Into<String>, prompt_len: usize, output_len: usize) -> Self {
        Self {
            prompt: prompt.into(),
            prompt_len,
            output_len,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ConversationEntry {
    #[serde(alias = "conversation", default)]
    conversations: Vec<Turn>,
}

#[derive(Debug, Deserialize)]
struct Turn {
    #[serde(alias = "content")]
    value: String,
}

/// Loads `(prompt, completion)` pairs from a ShareGPT-style dataset.
///
/// Accepts either a JSON array of entries or JSONL with one entry per line.
/// Entries with fewer than two turns are skipped.
pub fn load_conversations(path: &Path) -> Result<Vec<(String, String)>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read dataset {}", path.display()))?;

    let entries: Vec<ConversationEntry> = if contents.trim_start().starts_with('[') {
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse dataset {}", path.display()))?
    } else {
        let mut entries = Vec::new();
        for (number, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ConversationEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!("Skipping dataset line {}: {}", number + 1, e),
            }
        }
        entries
    };

    let pairs: Vec<(String, String)> = entries
        .into_iter()
        .filter(|entry| entry.conversations.len() >= 2)
        .map(|entry| {
            let mut turns = entry.conversations.into_iter();
            let prompt = turns.next().map(|t| t.value).unwrap_or_default();
            let completion = turns.next().map(|t| t.value).unwrap_or_default();
            (prompt, completion)
        })
        .collect();

    debug!(
        "Loaded {} conversations with at least two turns from {}",
        pairs.len(),
        path.display()
    );

    Ok(pairs)
}

/// Tokenizes pairs and keeps the ones usable as benchmark requests.
pub fn build_requests(
    pairs: Vec<(String, String)>,
    tokenizer: &Tokenizer,
    prompt_len_limit: usize,
) -> Result<Vec<Request>> {
    let mut requests = Vec::with_capacity(pairs.len());

    for (prompt, completion) in pairs {
        let prompt_len = tokenizer.count_tokens(&prompt)?;
        let output_len = tokenizer.count_tokens(&completion)?;

        if prompt_len < MIN_SEQUENCE_TOKENS || output_len < MIN_SEQUENCE_TOKENS {
            continue;
        }
        if prompt_len > prompt_len_limit || prompt_len + output_len > MAX_SEQUENCE_TOKENS {
            continue;
        }

        requests.push(Request {
            prompt,
            prompt_len,
            output_len,
        });
    }

    Ok(requests)
}

/// Draws exactly `count` requests without replacement.
pub fn sample<R: Rng + ?Sized>(
    requests: &[Request],
    count: usize,
    rng: &mut R,
) -> Result<Vec<Request>> {
    if requests.len() < count {
        bail!(
            "dataset has only {} usable requests, {} were asked for",
            requests.len(),
            count
        );
    }

    Ok(requests.choose_multiple(rng, count).cloned().collect())
}

/// Produces the request list for a run: load, tokenize, filter, sample.
pub fn sample_requests<R: Rng + ?Sized>(
    path: &Path,
    tokenizer: &Tokenizer,
    count: usize,
    prompt_len_limit: usize,
    rng: &mut R,
) -> Result<Vec<Request>> {
    let pairs = load_conversations(path)?;
    let candidates = build_requests(pairs, tokenizer, prompt_len_limit)?;
    info!(
        "{} of the dataset's conversations fit the length limits",
        candidates.len()
    );
    sample(&candidates, count, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::io::Write;

    const LONG: &str = "The quick brown fox jumps over the lazy dog near the river bank.";

    fn dataset_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn tokenizer() -> Tokenizer {
        Tokenizer::load("cl100k_base", false).unwrap()
    }

    #[test]
    fn test_load_json_array() {
        let file = dataset_file(&format!(
            r#"[
                {{"id": "a", "conversations": [{{"from": "human", "value": "{LONG}"}}, {{"from": "gpt", "value": "{LONG}"}}]}},
                {{"id": "b", "conversations": [{{"from": "human", "value": "only one turn"}}]}},
                {{"id": "c", "conversations": []}}
            ]"#
        ));

        let pairs = load_conversations(file.path()).unwrap();
        assert_eq!(pairs, vec![(LONG.to_string(), LONG.to_string())]);
    }

    #[test]
    fn test_load_jsonl() {
        let file = dataset_file(&format!(
            "{{\"conversations\": [{{\"role\": \"user\", \"content\": \"{LONG}\"}}, {{\"role\": \"assistant\", \"content\": \"reply\"}}]}}\n\nnot json\n"
        ));

        let pairs = load_conversations(file.path()).unwrap();
        assert_eq!(pairs.len(), 1);
        assert_eq!(pairs[0].1, "reply");
    }

    #[test]
    fn test_build_requests_filters_lengths() {
        let tokenizer = tokenizer();
        let pairs = vec![
            (LONG.to_string(), LONG.to_string()),
            ("hi".to_string(), LONG.to_string()),
            (LONG.to_string(), "ok".to_string()),
        ];

        let requests = build_requests(pairs.clone(), &tokenizer, 1024).unwrap();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.prompt, LONG);
        assert!(request.prompt_len >= MIN_SEQUENCE_TOKENS);
        assert_eq!(request.prompt_len, request.output_len);

        // A limit below the prompt length removes the remaining pair too.
        let limited = build_requests(pairs, &tokenizer, request.prompt_len - 1).unwrap();
        assert!(limited.is_empty());
    }

    #[test]
    fn test_build_requests_caps_total_length() {
        let tokenizer = tokenizer();
        let huge = "word ".repeat(1500);
        let requests =
            build_requests(vec![(huge.clone(), huge)], &tokenizer, usize::MAX).unwrap();
        assert!(requests.is_empty());
    }

    #[test]
    fn test_sample_is_seeded_and_exact() {
        let requests: Vec<Request> = (0..50)
            .map(|i| Request::new(format!("prompt {i}"), 10 + i, 5))
            .collect();

        let first = sample(&requests, 10, &mut StdRng::seed_from_u64(42)).unwrap();
        let second = sample(&requests, 10, &mut StdRng::seed_from_u64(42)).unwrap();
        assert_eq!(first.len(), 10);
        assert_eq!(first, second);

        let mut prompts: Vec<&str> = first.iter().map(|r| r.prompt.as_str()).collect();
        prompts.sort();
        prompts.dedup();
        assert_eq!(prompts.len(), 10, "sampling must not repeat requests");
    }

    #[test]
    fn test_sample_rejects_short_dataset() {
        let requests = vec![Request::new("a b c d e", 5, 5)];
        let err = sample(&requests, 2, &mut StdRng::seed_from_u64(0)).unwrap_err();
        assert!(err.to_string().contains("only 1 usable requests"));
    }
}
