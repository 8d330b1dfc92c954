//! Tokenizer seam and the `tokenizers` crate implementation

use candle_core::Tensor;
use std::ops::Deref;
use tokenizers::{
    truncate_encodings, Encoding, PostProcessor, Tokenizer, TruncationParams, TruncationStrategy,
};

use crate::error::{Error, Result};

/// Token IDs and attention mask for one encoded input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizedInput {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
}

impl TokenizedInput {
    /// Create from encoding
    pub fn from_encoding(encoding: &Encoding) -> Self {
        Self {
            input_ids: encoding.get_ids().to_vec(),
            attention_mask: encoding.get_attention_mask().to_vec(),
        }
    }

    /// Pad to target length
    pub fn pad_to_length(&mut self, target_length: usize, pad_token_id: u32) {
        while self.input_ids.len() < target_length {
            self.input_ids.push(pad_token_id);
            self.attention_mask.push(0);
        }
    }

    /// Truncate to target length
    pub fn truncate_to_length(&mut self, target_length: usize) {
        if self.input_ids.len() > target_length {
            self.input_ids.truncate(target_length);
            self.attention_mask.truncate(target_length);
        }
    }

    /// Truncate and pad so the sequence is exactly `length` tokens
    pub fn fixed_length(mut self, length: usize, pad_token_id: u32) -> Self {
        self.truncate_to_length(length);
        self.pad_to_length(length, pad_token_id);
        self
    }

    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }
}

/// What the adapters need from a tokenizer
#[cfg_attr(test, mockall::automock)]
pub trait TextTokenizer: Send + Sync {
    /// Encode a single text with special tokens
    fn encode(&self, text: &str) -> Result<TokenizedInput>;

    /// Encode a (premise, hypothesis) pair, truncating to `max_length` if given
    fn encode_pair(&self, first: &str, second: &str, max_length: Option<usize>)
        -> Result<TokenizedInput>;

    /// Decode ids back to text
    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String>;

    /// Padding token id
    fn pad_token_id(&self) -> u32;
}

/// Encode a text truncated and padded to exactly `max_length` tokens
pub fn encode_fixed<T: TextTokenizer + ?Sized>(
    tokenizer: &T,
    text: &str,
    max_length: usize,
) -> Result<TokenizedInput> {
    Ok(tokenizer
        .encode(text)?
        .fixed_length(max_length, tokenizer.pad_token_id()))
}

/// Stack equal-length token rows into a `[rows, width]` u32 tensor
pub fn batch_tensor(rows: &[&[u32]], device: &candle_core::Device) -> Result<Tensor> {
    let width = rows.first().map(|row| row.len()).unwrap_or(0);
    if rows.iter().any(|row| row.len() != width) {
        return Err(Error::invalid_input("all rows in a batch must have the same length"));
    }
    let flat: Vec<u32> = rows.iter().flat_map(|row| row.iter().copied()).collect();
    Ok(Tensor::from_vec(flat, (rows.len(), width), device)?)
}

impl TextTokenizer for Tokenizer {
    fn encode(&self, text: &str) -> Result<TokenizedInput> {
        let encoding = self
            .deref()
            .encode(text, true)
            .map_err(|e| Error::tokenizer(format!("encoding failed: {}", e)))?;
        Ok(TokenizedInput::from_encoding(&encoding))
    }

    fn encode_pair(
        &self,
        first: &str,
        second: &str,
        max_length: Option<usize>,
    ) -> Result<TokenizedInput> {
        let pair_error =
            |e: tokenizers::Error| Error::tokenizer(format!("pair encoding failed: {}", e));
        let Some(max_length) = max_length else {
            let encoding = self.deref().encode((first, second), true).map_err(pair_error)?;
            return Ok(TokenizedInput::from_encoding(&encoding));
        };

        // Trim both sequences before the template adds its special tokens so
        // the second sequence and the closing separator survive.
        let first = self.deref().encode(first, false).map_err(pair_error)?;
        let second = self.deref().encode(second, false).map_err(pair_error)?;
        let added = self
            .get_post_processor()
            .map(|p| p.added_tokens(true))
            .unwrap_or(0);
        let params = TruncationParams {
            max_length: max_length.saturating_sub(added),
            strategy: TruncationStrategy::LongestFirst,
            ..Default::default()
        };
        let (first, second) =
            truncate_encodings(first, Some(second), &params).map_err(pair_error)?;
        let encoding = self
            .deref()
            .post_process(first, second, true)
            .map_err(pair_error)?;
        Ok(TokenizedInput::from_encoding(&encoding))
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.deref()
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::tokenizer(format!("decoding failed: {}", e)))
    }

    fn pad_token_id(&self) -> u32 {
        self.get_padding().map(|p| p.pad_id).unwrap_or(0)
    }
}

/// Load a `tokenizer.json` from disk
pub fn load_tokenizer(path: &str) -> anyhow::Result<Tokenizer> {
    Tokenizer::from_file(path).map_err(|e| anyhow::anyhow!("Failed to load tokenizer: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(ids: &[u32]) -> TokenizedInput {
        TokenizedInput {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
        }
    }

    #[test]
    fn test_pad_to_length() {
        let mut tokens = input(&[101, 7, 102]);
        tokens.pad_to_length(5, 0);
        assert_eq!(tokens.input_ids, vec![101, 7, 102, 0, 0]);
        assert_eq!(tokens.attention_mask, vec![1, 1, 1, 0, 0]);
    }

    #[test]
    fn test_truncate_to_length() {
        let mut tokens = input(&[101, 7, 8, 9, 102]);
        tokens.truncate_to_length(3);
        assert_eq!(tokens.input_ids, vec![101, 7, 8]);
        assert_eq!(tokens.attention_mask, vec![1, 1, 1]);
    }

    #[test]
    fn test_fixed_length_is_exact() {
        assert_eq!(input(&[1, 2]).fixed_length(4, 9).len(), 4);
        assert_eq!(input(&[1, 2, 3, 4, 5, 6]).fixed_length(4, 9).len(), 4);
    }

    #[test]
    fn test_encode_fixed_uses_pad_token() {
        let mut tokenizer = MockTextTokenizer::new();
        tokenizer.expect_encode().returning(|_| Ok(input(&[101, 102])));
        tokenizer.expect_pad_token_id().return_const(3u32);

        let tokens = encode_fixed(&tokenizer, "hi", 4).unwrap();
        assert_eq!(tokens.input_ids, vec![101, 102, 3, 3]);
        assert_eq!(tokens.attention_mask, vec![1, 1, 0, 0]);
    }

    #[test]
    fn test_batch_tensor_shape() {
        let a = [1u32, 2, 3];
        let b = [4u32, 5, 6];
        let tensor = batch_tensor(&[&a, &b], &candle_core::Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[2, 3]);
        assert_eq!(tensor.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn test_batch_tensor_rejects_ragged_rows() {
        let a = [1u32, 2];
        let b = [3u32];
        assert!(batch_tensor(&[&a, &b], &candle_core::Device::Cpu).is_err());
    }

    fn bert_pair_tokenizer() -> Tokenizer {
        use std::collections::HashMap;
        use tokenizers::models::wordlevel::WordLevel;
        use tokenizers::pre_tokenizers::whitespace::Whitespace;
        use tokenizers::processors::template::TemplateProcessing;

        let vocab: HashMap<String, u32> = [
            ("[UNK]", 0),
            ("[CLS]", 1),
            ("[SEP]", 2),
            ("word", 3),
            ("This", 4),
            ("example", 5),
            ("is", 6),
            ("sports", 7),
            (".", 8),
        ]
        .into_iter()
        .map(|(token, id)| (token.to_string(), id))
        .collect();
        let model = WordLevel::builder()
            .vocab(vocab)
            .unk_token("[UNK]".to_string())
            .build()
            .unwrap();
        let template = TemplateProcessing::builder()
            .try_single("[CLS] $A [SEP]")
            .unwrap()
            .try_pair("[CLS] $A [SEP] $B:1 [SEP]:1")
            .unwrap()
            .special_tokens(vec![("[CLS]", 1), ("[SEP]", 2)])
            .build()
            .unwrap();

        let mut tokenizer = Tokenizer::new(model);
        tokenizer.with_pre_tokenizer(Some(Whitespace::default()));
        tokenizer.with_post_processor(Some(template));
        tokenizer
    }

    #[test]
    fn test_encode_pair_keeps_hypothesis_for_long_premise() {
        let tokenizer = bert_pair_tokenizer();
        let premise = "word ".repeat(600);

        let encoded = tokenizer
            .encode_pair(&premise, "This example is sports.", Some(16))
            .unwrap();

        assert_eq!(encoded.len(), 16);
        assert_eq!(encoded.input_ids[0], 1);
        assert_eq!(&encoded.input_ids[10..], &[4, 5, 6, 7, 8, 2]);
        assert_eq!(encoded.input_ids[9], 2);
        assert_eq!(encoded.attention_mask, vec![1; 16]);
    }

    #[test]
    fn test_encode_pair_without_limit_keeps_everything() {
        let tokenizer = bert_pair_tokenizer();
        let encoded = tokenizer.encode_pair("word word", "This is sports.", None).unwrap();
        assert_eq!(encoded.input_ids, vec![1, 3, 3, 2, 4, 6, 7, 8, 2]);
    }
}
