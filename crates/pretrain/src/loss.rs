use std::collections::BTreeMap;

use candle_core::{DType, Tensor, D};
use candle_nn::ops;

use crate::{batch::Batch, PretrainError};

/// Scalar training metrics keyed by name. The language-model loss
/// always lives under `lm_loss`.
pub type LossDict = BTreeMap<String, f64>;

pub const LM_LOSS_KEY: &str = "lm_loss";

#[derive(Debug, Clone)]
pub struct LossOutput {
    /// Scalar loss tensor, still attached to the autograd graph.
    pub loss: Tensor,
    pub loss_value: f64,
    /// Number of positions that carried loss weight.
    pub counted_tokens: usize,
}

impl LossOutput {
    pub fn to_dict(&self) -> LossDict {
        let mut dict = LossDict::new();
        dict.insert(LM_LOSS_KEY.to_string(), self.loss_value);
        dict
    }
}

/// Masked autoregressive cross entropy. Positions with a zero loss
/// mask contribute nothing; the mean runs over the mask weight, not
/// the raw token count.
pub fn masked_cross_entropy(logits: &Tensor, batch: &Batch) -> Result<LossOutput, PretrainError> {
    let (batch_size, seq_len, vocab_size) = logits.dims3().map_err(to_runtime_error)?;
    let token_count = batch_size * seq_len;
    if token_count == 0 || vocab_size == 0 {
        return Err(PretrainError::runtime(
            "empty logits tensor in loss computation",
        ));
    }
    if batch.labels.dims() != [batch_size, seq_len] {
        return Err(PretrainError::runtime(
            "label tensor shape does not match logits",
        ));
    }

    let logits_flat = logits
        .reshape((token_count, vocab_size))
        .map_err(to_runtime_error)?;
    let log_probs = ops::log_softmax(&logits_flat, D::Minus1).map_err(to_runtime_error)?;

    let labels_flat = batch
        .labels
        .reshape((token_count,))
        .map_err(to_runtime_error)?
        .to_dtype(DType::U32)
        .map_err(to_runtime_error)?;
    let label_indices = labels_flat.unsqueeze(1).map_err(to_runtime_error)?;
    let nll = log_probs
        .gather(&label_indices, 1)
        .map_err(to_runtime_error)?
        .neg()
        .map_err(to_runtime_error)?
        .squeeze(1)
        .map_err(to_runtime_error)?;

    let mask_flat = batch
        .loss_mask
        .reshape((token_count,))
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?;
    let mask_total = mask_flat
        .sum_all()
        .map_err(to_runtime_error)?
        .to_vec0::<f32>()
        .map_err(to_runtime_error)?;
    if mask_total <= 0.0 {
        return Err(PretrainError::runtime(
            "loss mask zeroed out every position in the batch",
        ));
    }

    let weighted = (&nll * &mask_flat).map_err(to_runtime_error)?;
    let loss = weighted
        .sum_all()
        .map_err(to_runtime_error)?
        .affine(1.0 / mask_total as f64, 0.0)
        .map_err(to_runtime_error)?;
    let loss_value = loss.to_vec0::<f32>().map_err(to_runtime_error)? as f64;

    Ok(LossOutput {
        loss,
        loss_value,
        counted_tokens: mask_total.round() as usize,
    })
}

fn to_runtime_error(err: candle_core::Error) -> PretrainError {
    PretrainError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DataConfig;
    use candle_core::Device;

    fn data_config(eod_mask_loss: bool) -> DataConfig {
        DataConfig {
            seq_len: 2,
            micro_batch_size: 1,
            eod_token_id: 9,
            eod_mask_loss,
            train_tokens: None,
            valid_tokens: None,
        }
    }

    fn uniform_logits(batch: usize, seq: usize, vocab: usize) -> Tensor {
        Tensor::zeros((batch, seq, vocab), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn uniform_logits_give_log_vocab_loss() {
        let raw = Tensor::from_slice(&[1u32, 2, 3], (1, 3), &Device::Cpu).unwrap();
        let batch = Batch::from_raw(&raw, &data_config(false)).unwrap();
        let out = masked_cross_entropy(&uniform_logits(1, 2, 10), &batch).unwrap();
        assert!((out.loss_value - (10f64).ln()).abs() < 1e-5);
        assert_eq!(out.counted_tokens, 2);
        assert_eq!(out.to_dict()[LM_LOSS_KEY], out.loss_value);
    }

    #[test]
    fn masked_positions_do_not_count() {
        // First input token is the eod id, so that position drops out.
        let raw = Tensor::from_slice(&[9u32, 2, 3], (1, 3), &Device::Cpu).unwrap();
        let batch = Batch::from_raw(&raw, &data_config(true)).unwrap();
        let out = masked_cross_entropy(&uniform_logits(1, 2, 10), &batch).unwrap();
        assert_eq!(out.counted_tokens, 1);
        assert!((out.loss_value - (10f64).ln()).abs() < 1e-5);
    }

    #[test]
    fn fully_masked_batch_is_an_error() {
        let raw = Tensor::from_slice(&[9u32, 9, 9], (1, 3), &Device::Cpu).unwrap();
        let batch = Batch::from_raw(&raw, &data_config(true)).unwrap();
        assert!(masked_cross_entropy(&uniform_logits(1, 2, 10), &batch).is_err());
    }
}
