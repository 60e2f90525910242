use std::{fs, path::Path};

use candle_core::{Device, Tensor};

use crate::PretrainError;

/// Source of raw training batches. Each item is a `[batch, seq_len + 1]`
/// u32 tensor of token ids; the extra position feeds the input/label
/// shift downstream. `Ok(None)` means the stream is exhausted.
pub trait DataIterator {
    fn next_raw(&mut self) -> Result<Option<Tensor>, PretrainError>;
}

impl<T: DataIterator + ?Sized> DataIterator for &mut T {
    fn next_raw(&mut self) -> Result<Option<Tensor>, PretrainError> {
        (**self).next_raw()
    }
}

/// Flat token stream backed by an in-memory id buffer, sliced into
/// fixed-shape batches. Wraps around at the end of the buffer so long
/// runs never starve.
pub struct TokenStream {
    tokens: Vec<u32>,
    cursor: usize,
    batch_size: usize,
    seq_len: usize,
    device: Device,
}

impl TokenStream {
    pub fn new(
        tokens: Vec<u32>,
        batch_size: usize,
        seq_len: usize,
        device: Device,
    ) -> Result<Self, PretrainError> {
        let needed = batch_size * (seq_len + 1);
        if tokens.len() < needed {
            return Err(PretrainError::data(format!(
                "token stream holds {} tokens but one batch needs {}",
                tokens.len(),
                needed
            )));
        }
        Ok(Self {
            tokens,
            cursor: 0,
            batch_size,
            seq_len,
            device,
        })
    }

    /// Loads a binary file of little-endian u32 token ids.
    pub fn from_path(
        path: impl AsRef<Path>,
        batch_size: usize,
        seq_len: usize,
        device: Device,
    ) -> Result<Self, PretrainError> {
        let path = path.as_ref();
        let bytes = fs::read(path)?;
        if bytes.len() % 4 != 0 {
            return Err(PretrainError::data(format!(
                "token file {} length {} is not a multiple of 4",
                path.display(),
                bytes.len()
            )));
        }
        let tokens = bytes
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();
        Self::new(tokens, batch_size, seq_len, device)
    }

    fn next_sample(&mut self) -> Vec<u32> {
        let width = self.seq_len + 1;
        let mut sample = Vec::with_capacity(width);
        for _ in 0..width {
            sample.push(self.tokens[self.cursor]);
            self.cursor += 1;
            if self.cursor >= self.tokens.len() {
                self.cursor = 0;
            }
        }
        sample
    }
}

impl DataIterator for TokenStream {
    fn next_raw(&mut self) -> Result<Option<Tensor>, PretrainError> {
        let width = self.seq_len + 1;
        let mut flat = Vec::with_capacity(self.batch_size * width);
        for _ in 0..self.batch_size {
            flat.extend_from_slice(&self.next_sample());
        }
        let raw = Tensor::from_vec(flat, (self.batch_size, width), &self.device)
            .map_err(|err| PretrainError::data(err.to_string()))?;
        Ok(Some(raw))
    }
}

/// Turns token ids back into text. Character-level perplexity needs a
/// decode path but never a full tokenizer, so this stays a seam.
pub trait Detokenizer: Send + Sync {
    fn decode(&self, tokens: &[u32]) -> Result<String, PretrainError>;
}

impl<F> Detokenizer for F
where
    F: Fn(&[u32]) -> String + Send + Sync,
{
    fn decode(&self, tokens: &[u32]) -> Result<String, PretrainError> {
        Ok(self(tokens))
    }
}

/// Encodes text into token ids, used to seed soft-prompt embeddings
/// from an initialization string.
pub trait TokenEncoder: Send + Sync {
    fn encode(&self, text: &str) -> Result<Vec<u32>, PretrainError>;
}

impl<F> TokenEncoder for F
where
    F: Fn(&str) -> Vec<u32> + Send + Sync,
{
    fn encode(&self, text: &str) -> Result<Vec<u32>, PretrainError> {
        Ok(self(text))
    }
}

/// Pass-through iterator that counts tokens and decoded characters of
/// every batch it serves. Wrap the validation iterator, run the eval
/// pass, then read `tokens_per_char`; dropping the counter releases
/// the wrapped iterator unchanged.
pub struct CharCounter<'a> {
    inner: &'a mut dyn DataIterator,
    detokenizer: &'a dyn Detokenizer,
    token_count: usize,
    char_count: usize,
}

impl<'a> CharCounter<'a> {
    pub fn new(inner: &'a mut dyn DataIterator, detokenizer: &'a dyn Detokenizer) -> Self {
        Self {
            inner,
            detokenizer,
            token_count: 0,
            char_count: 0,
        }
    }

    pub fn token_count(&self) -> usize {
        self.token_count
    }

    pub fn char_count(&self) -> usize {
        self.char_count
    }

    /// Average tokens per character over everything served so far.
    pub fn tokens_per_char(&self) -> Result<f64, PretrainError> {
        if self.char_count == 0 {
            return Err(PretrainError::data(
                "no characters counted; run at least one batch before reading tokens_per_char",
            ));
        }
        Ok(self.token_count as f64 / self.char_count as f64)
    }
}

impl DataIterator for CharCounter<'_> {
    fn next_raw(&mut self) -> Result<Option<Tensor>, PretrainError> {
        let raw = match self.inner.next_raw()? {
            Some(raw) => raw,
            None => return Ok(None),
        };
        let flat = raw
            .flatten_all()
            .and_then(|t| t.to_vec1::<u32>())
            .map_err(|err| PretrainError::data(err.to_string()))?;
        self.token_count += flat.len();
        self.char_count += self.detokenizer.decode(&flat)?.chars().count();
        Ok(Some(raw))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(tokens: Vec<u32>, batch_size: usize, seq_len: usize) -> TokenStream {
        TokenStream::new(tokens, batch_size, seq_len, Device::Cpu).unwrap()
    }

    #[test]
    fn token_stream_wraps_around() {
        let mut stream = stream((0..6).collect(), 1, 2);
        let first = stream.next_raw().unwrap().unwrap();
        assert_eq!(first.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 2]]);
        let second = stream.next_raw().unwrap().unwrap();
        assert_eq!(second.to_vec2::<u32>().unwrap(), vec![vec![3, 4, 5]]);
        let wrapped = stream.next_raw().unwrap().unwrap();
        assert_eq!(wrapped.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn token_stream_rejects_short_buffers() {
        assert!(TokenStream::new(vec![1, 2], 1, 4, Device::Cpu).is_err());
    }

    #[test]
    fn char_counter_tracks_tokens_per_char() {
        let mut inner = stream((0..12).collect(), 2, 2);
        // Every token decodes to two characters.
        let detok = |tokens: &[u32]| "ab".repeat(tokens.len());
        let mut counter = CharCounter::new(&mut inner, &detok);

        counter.next_raw().unwrap().unwrap();
        assert_eq!(counter.token_count(), 6);
        assert_eq!(counter.char_count(), 12);
        assert!((counter.tokens_per_char().unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn char_counter_requires_traffic() {
        let mut inner = stream((0..6).collect(), 1, 2);
        let detok = |tokens: &[u32]| "x".repeat(tokens.len());
        let counter = CharCounter::new(&mut inner, &detok);
        assert!(counter.tokens_per_char().is_err());
    }
}
