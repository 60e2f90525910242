use candle_core::{DType, Tensor};

use crate::{
    config::DataConfig,
    data::DataIterator,
    parallel::ParallelGroup,
    PretrainError,
};

/// One model-ready batch derived from a raw `[batch, seq_len + 1]`
/// token block.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input ids, the raw block minus its last position.
    pub tokens: Tensor,
    /// Target ids, the raw block shifted left by one.
    pub labels: Tensor,
    /// f32 weights per target position; zero where the loss is masked.
    pub loss_mask: Tensor,
    /// Causal lower-triangular mask, shape `[1, 1, seq, seq]`.
    pub attention_mask: Tensor,
    /// Position ids `0..seq` replicated per row.
    pub position_ids: Tensor,
}

impl Batch {
    /// Splits a raw block into inputs and shifted labels and derives
    /// the companion masks. The loss mask zeroes positions whose input
    /// token is the end-of-document id when `eod_mask_loss` is set.
    pub fn from_raw(raw: &Tensor, data_config: &DataConfig) -> Result<Self, PretrainError> {
        let (batch_size, width) = raw
            .dims2()
            .map_err(|err| PretrainError::data(err.to_string()))?;
        if width < 2 {
            return Err(PretrainError::data(format!(
                "raw batch width {} too small to shift into inputs and labels",
                width
            )));
        }
        let seq_len = width - 1;
        let device = raw.device();

        let tokens = raw
            .narrow(1, 0, seq_len)
            .map_err(to_data_error)?
            .contiguous()
            .map_err(to_data_error)?;
        let labels = raw
            .narrow(1, 1, seq_len)
            .map_err(to_data_error)?
            .contiguous()
            .map_err(to_data_error)?;

        let loss_mask = if data_config.eod_mask_loss {
            tokens
                .ne(data_config.eod_token_id)
                .map_err(to_data_error)?
                .to_dtype(DType::F32)
                .map_err(to_data_error)?
        } else {
            Tensor::ones((batch_size, seq_len), DType::F32, device).map_err(to_data_error)?
        };

        let attention_mask = Tensor::tril2(seq_len, DType::F32, device)
            .map_err(to_data_error)?
            .reshape((1, 1, seq_len, seq_len))
            .map_err(to_data_error)?;

        let position_ids = Tensor::arange(0u32, seq_len as u32, device)
            .map_err(to_data_error)?
            .unsqueeze(0)
            .map_err(to_data_error)?
            .expand((batch_size, seq_len))
            .map_err(to_data_error)?
            .contiguous()
            .map_err(to_data_error)?;

        Ok(Self {
            tokens,
            labels,
            loss_mask,
            attention_mask,
            position_ids,
        })
    }

    pub fn batch_size(&self) -> Result<usize, PretrainError> {
        let (batch_size, _) = self
            .tokens
            .dims2()
            .map_err(|err| PretrainError::data(err.to_string()))?;
        Ok(batch_size)
    }

    pub fn seq_len(&self) -> Result<usize, PretrainError> {
        let (_, seq_len) = self
            .tokens
            .dims2()
            .map_err(|err| PretrainError::data(err.to_string()))?;
        Ok(seq_len)
    }

    /// Regroups the batch the way pipeline engines consume it: the
    /// forward inputs first, the loss inputs second.
    pub fn pipe_format(&self) -> ((Tensor, Tensor, Tensor), (Tensor, Tensor)) {
        (
            (
                self.tokens.clone(),
                self.position_ids.clone(),
                self.attention_mask.clone(),
            ),
            (self.labels.clone(), self.loss_mask.clone()),
        )
    }
}

/// Pulls the next raw block on the group's source rank, replicates it
/// to the other ranks, and shapes it into a `Batch`. Only the source
/// rank needs a live iterator; the rest pass `None`.
pub fn next_batch(
    iterator: Option<&mut (dyn DataIterator + '_)>,
    group: &dyn ParallelGroup,
    data_config: &DataConfig,
) -> Result<Option<Batch>, PretrainError> {
    let local = match iterator {
        Some(iterator) => match iterator.next_raw()? {
            Some(raw) => Some(raw),
            None => return Ok(None),
        },
        None => None,
    };
    let raw = group.broadcast(0, local)?;
    Batch::from_raw(&raw, data_config).map(Some)
}

fn to_data_error(err: candle_core::Error) -> PretrainError {
    PretrainError::data(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::TokenStream, parallel::SingleProcess};
    use candle_core::Device;

    fn data_config(eod_token_id: u32, eod_mask_loss: bool) -> DataConfig {
        DataConfig {
            seq_len: 3,
            micro_batch_size: 1,
            eod_token_id,
            eod_mask_loss,
            train_tokens: None,
            valid_tokens: None,
        }
    }

    #[test]
    fn labels_are_inputs_shifted_by_one() {
        let raw = Tensor::from_slice(&[5u32, 6, 7, 8], (1, 4), &Device::Cpu).unwrap();
        let batch = Batch::from_raw(&raw, &data_config(0, false)).unwrap();
        assert_eq!(batch.tokens.to_vec2::<u32>().unwrap(), vec![vec![5, 6, 7]]);
        assert_eq!(batch.labels.to_vec2::<u32>().unwrap(), vec![vec![6, 7, 8]]);
        assert_eq!(
            batch.position_ids.to_vec2::<u32>().unwrap(),
            vec![vec![0, 1, 2]]
        );
    }

    #[test]
    fn eod_positions_drop_out_of_the_loss_mask() {
        let raw = Tensor::from_slice(&[5u32, 9, 7, 8], (1, 4), &Device::Cpu).unwrap();
        let masked = Batch::from_raw(&raw, &data_config(9, true)).unwrap();
        assert_eq!(
            masked.loss_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 0.0, 1.0]]
        );

        let unmasked = Batch::from_raw(&raw, &data_config(9, false)).unwrap();
        assert_eq!(
            unmasked.loss_mask.to_vec2::<f32>().unwrap(),
            vec![vec![1.0, 1.0, 1.0]]
        );
    }

    #[test]
    fn attention_mask_is_causal() {
        let raw = Tensor::from_slice(&[1u32, 2, 3, 4], (1, 4), &Device::Cpu).unwrap();
        let batch = Batch::from_raw(&raw, &data_config(0, false)).unwrap();
        let mask = batch
            .attention_mask
            .reshape((3, 3))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(
            mask,
            vec![
                vec![1.0, 0.0, 0.0],
                vec![1.0, 1.0, 0.0],
                vec![1.0, 1.0, 1.0],
            ]
        );
    }

    #[test]
    fn pipe_format_groups_forward_and_loss_inputs() {
        let raw = Tensor::from_slice(&[1u32, 2, 3, 4], (1, 4), &Device::Cpu).unwrap();
        let batch = Batch::from_raw(&raw, &data_config(0, false)).unwrap();
        assert_eq!(batch.batch_size().unwrap(), 1);
        assert_eq!(batch.seq_len().unwrap(), 3);

        let ((tokens, position_ids, attention_mask), (labels, loss_mask)) = batch.pipe_format();
        assert_eq!(tokens.to_vec2::<u32>().unwrap(), vec![vec![1, 2, 3]]);
        assert_eq!(labels.to_vec2::<u32>().unwrap(), vec![vec![2, 3, 4]]);
        assert_eq!(position_ids.dims(), &[1, 3]);
        assert_eq!(attention_mask.dims(), &[1, 1, 3, 3]);
        assert_eq!(loss_mask.dims(), &[1, 3]);
    }

    #[test]
    fn next_batch_pulls_through_the_group() {
        let mut stream = TokenStream::new((0..8).collect(), 1, 3, Device::Cpu).unwrap();
        let group = SingleProcess;
        let config = data_config(0, false);
        let batch = next_batch(Some(&mut stream), &group, &config)
            .unwrap()
            .unwrap();
        assert_eq!(batch.tokens.to_vec2::<u32>().unwrap(), vec![vec![0, 1, 2]]);
    }
}
