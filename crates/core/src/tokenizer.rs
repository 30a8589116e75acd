use std::path::Path;
use tokenizers::models::wordlevel::WordLevel;
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::Tokenizer;

/// Token standing in for words outside the vocabulary; always id 0.
pub const UNK_TOKEN: &str = "<unk>";

pub struct TokenizerWrapper {
    inner: Tokenizer,
}

impl TokenizerWrapper {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let inner =
            Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("tokenizer load: {e}"))?;
        Ok(Self { inner })
    }

    /// Word-level tokenizer over a fixed vocabulary, whitespace/punctuation split.
    ///
    /// Id 0 is `<unk>`; the words follow in order, duplicates collapsed.
    pub fn from_vocab<S: AsRef<str>>(words: &[S]) -> anyhow::Result<Self> {
        let mut vocab = ahash::AHashMap::new();
        vocab.insert(UNK_TOKEN.to_string(), 0u32);
        for word in words {
            let next = vocab.len() as u32;
            vocab.entry(word.as_ref().to_string()).or_insert(next);
        }
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token(UNK_TOKEN.into())
            .build()
            .map_err(|e| anyhow::anyhow!("build word-level model: {e}"))?;
        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace {}));
        Ok(Self { inner: tokenizer })
    }

    #[cfg(any(test, feature = "test-utils"))]
    pub fn for_testing(vocab_size: usize) -> Self {
        let words: Vec<String> = (1..vocab_size).map(|i| format!("t{i}")).collect();
        Self::from_vocab(&words).expect("build test tokenizer")
    }

    pub fn encode(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| anyhow::anyhow!("encode: {e}"))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_vocab_assigns_ids_in_order() {
        let tok = TokenizerWrapper::from_vocab(&["pick", "up", "the", "cup"]).unwrap();
        assert_eq!(tok.vocab_size(), 5);
        assert_eq!(tok.encode("pick up the cup").unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn unknown_words_map_to_unk() {
        let tok = TokenizerWrapper::from_vocab(&["open", "drawer"]).unwrap();
        assert_eq!(tok.encode("open the drawer").unwrap(), vec![1, 0, 2]);
    }

    #[test]
    fn duplicate_words_collapse() {
        let tok = TokenizerWrapper::from_vocab(&["go", "left", "go"]).unwrap();
        assert_eq!(tok.vocab_size(), 3);
    }

    #[test]
    fn empty_text_has_no_tokens() {
        let tok = TokenizerWrapper::for_testing(8);
        assert!(tok.encode("").unwrap().is_empty());
        assert_eq!(tok.encode("t3 t1").unwrap(), vec![3, 1]);
    }

    #[test]
    fn from_file_roundtrip() {
        let tok = TokenizerWrapper::from_vocab(&["stack", "blocks"]).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokenizer.json");
        tok.inner.save(&path, false).unwrap();

        let loaded = TokenizerWrapper::from_file(&path).unwrap();
        assert_eq!(loaded.encode("stack blocks").unwrap(), vec![1, 2]);
    }

    #[test]
    fn from_file_missing_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TokenizerWrapper::from_file(&dir.path().join("missing.json")).is_err());
    }
}
