use tokenizers::Tokenizer;

/// Token counter shared by the chunker and the token-budget checks around
/// it. Backed by a real BPE tokenizer when one can be loaded; falls back to
/// a whitespace heuristic otherwise so a missing model file degrades chunk
/// sizing rather than taking the pipeline down.
pub struct TokenCounter {
    tokenizer: Option<Tokenizer>,
}

const FALLBACK_REPO: &str = "gpt2";

impl TokenCounter {
    /// Tries the configured encoding repo first (`TOKENIZER_ENCODING`, a
    /// Hugging Face Hub repo id), then the gpt2 BPE, then gives up and
    /// counts whitespace-separated words.
    #[must_use]
    pub fn load(encoding_repo: &str) -> Self {
        match Tokenizer::from_pretrained(encoding_repo, None) {
            Ok(tokenizer) => return Self { tokenizer: Some(tokenizer) },
            Err(err) => tracing::warn!(error = %err, repo = encoding_repo, "tokenizer load failed"),
        }
        match Tokenizer::from_pretrained(FALLBACK_REPO, None) {
            Ok(tokenizer) => Self { tokenizer: Some(tokenizer) },
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    repo = FALLBACK_REPO,
                    "fallback tokenizer load failed, counting tokens by whitespace"
                );
                Self { tokenizer: None }
            }
        }
    }

    /// Deterministic whitespace-only counter, used by chunker tests that
    /// seed exact token budgets without depending on a downloaded BPE model.
    #[must_use]
    pub(crate) fn whitespace_only() -> Self {
        Self { tokenizer: None }
    }

    #[must_use]
    pub fn count_tokens(&self, text: &str) -> usize {
        match &self.tokenizer {
            Some(tokenizer) => tokenizer
                .encode(text, false)
                .map(|enc| enc.len())
                .unwrap_or_else(|_| whitespace_token_estimate(text)),
            None => whitespace_token_estimate(text),
        }
    }
}

fn whitespace_token_estimate(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_estimate_counts_words() {
        assert_eq!(whitespace_token_estimate("one two three"), 3);
        assert_eq!(whitespace_token_estimate(""), 0);
    }
}
