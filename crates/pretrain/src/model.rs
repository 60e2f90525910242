use candle_core::{DType, Device, Tensor, Var};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::{
    batch::Batch,
    config::PretrainConfig,
    data::TokenEncoder,
    PretrainError,
};

pub const SOFT_EMBEDDING_TAG: &str = "soft_embedding";

/// A named trainable tensor surfaced by a layer. Optimizers group and
/// filter on the name and the `trainable` flag.
#[derive(Debug, Clone)]
pub struct NamedParameter {
    pub name: String,
    pub var: Var,
    pub trainable: bool,
    /// Partitioned across model-parallel ranks. Every layer in the
    /// single-engine stack is replicated, so this stays false here;
    /// pipeline engines tag their sharded parameters.
    pub model_parallel: bool,
}

/// One stage of a sequential stack. Layers receive the previous
/// layer's output plus the batch so mask-aware blocks can reach the
/// attention mask and position ids.
pub trait Layer: Send {
    fn name(&self) -> &str;

    fn forward(&self, input: &Tensor, batch: &Batch) -> Result<Tensor, PretrainError>;

    fn parameters(&self) -> Vec<NamedParameter>;
}

/// Token-id to hidden-state lookup table.
pub struct WordEmbedding {
    weight: Var,
    hidden_size: usize,
}

impl WordEmbedding {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        device: &Device,
        seed: u64,
    ) -> Result<Self, PretrainError> {
        let weight = uniform_var(&[vocab_size, hidden_size], 0.02, device, seed)?;
        Ok(Self {
            weight,
            hidden_size,
        })
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }
}

impl Layer for WordEmbedding {
    fn name(&self) -> &str {
        "word_embedding"
    }

    fn forward(&self, input: &Tensor, _batch: &Batch) -> Result<Tensor, PretrainError> {
        let (batch_size, seq_len) = input.dims2().map_err(to_runtime_error)?;
        let flat = input.flatten_all().map_err(to_runtime_error)?;
        // index_select on the Var's tensor keeps the lookup on the
        // autograd graph.
        self.weight
            .as_tensor()
            .index_select(&flat, 0)
            .map_err(to_runtime_error)?
            .reshape((batch_size, seq_len, self.hidden_size))
            .map_err(to_runtime_error)
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        vec![NamedParameter {
            name: "word_embedding.weight".to_string(),
            var: self.weight.clone(),
            trainable: true,
            model_parallel: false,
        }]
    }
}

/// Learned prompt prefix prepended to the embedded sequence. The
/// prefix rows are seeded from an initialization string's embeddings
/// when one is given, otherwise drawn uniformly.
pub struct SoftEmbedding {
    prompt: Var,
    n_tokens: usize,
}

impl SoftEmbedding {
    pub fn new(
        embedding: &WordEmbedding,
        n_tokens: usize,
        init_tokens: &[u32],
        init_range: f64,
        device: &Device,
        seed: u64,
    ) -> Result<Self, PretrainError> {
        let hidden_size = embedding.hidden_size;
        let prompt = if init_tokens.is_empty() {
            uniform_var(&[n_tokens, hidden_size], init_range, device, seed)?
        } else {
            // Cycle the init tokens to cover every prompt position.
            let ids: Vec<u32> = (0..n_tokens)
                .map(|i| init_tokens[i % init_tokens.len()])
                .collect();
            let ids = Tensor::from_vec(ids, (n_tokens,), device).map_err(to_runtime_error)?;
            let rows = embedding
                .weight
                .as_tensor()
                .index_select(&ids, 0)
                .map_err(to_runtime_error)?;
            Var::from_tensor(&rows).map_err(to_runtime_error)?
        };
        Ok(Self { prompt, n_tokens })
    }

    pub fn n_tokens(&self) -> usize {
        self.n_tokens
    }
}

impl Layer for SoftEmbedding {
    fn name(&self) -> &str {
        SOFT_EMBEDDING_TAG
    }

    fn forward(&self, input: &Tensor, _batch: &Batch) -> Result<Tensor, PretrainError> {
        let (batch_size, _, hidden) = input.dims3().map_err(to_runtime_error)?;
        let prefix = self
            .prompt
            .as_tensor()
            .unsqueeze(0)
            .map_err(to_runtime_error)?
            .expand((batch_size, self.n_tokens, hidden))
            .map_err(to_runtime_error)?;
        Tensor::cat(&[&prefix, input], 1).map_err(to_runtime_error)
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        vec![NamedParameter {
            name: format!("{}.prompt", SOFT_EMBEDDING_TAG),
            var: self.prompt.clone(),
            trainable: true,
            model_parallel: false,
        }]
    }
}

/// Projects hidden states onto the vocabulary.
pub struct OutputHead {
    weight: Var,
}

impl OutputHead {
    pub fn new(
        vocab_size: usize,
        hidden_size: usize,
        device: &Device,
        seed: u64,
    ) -> Result<Self, PretrainError> {
        let weight = uniform_var(&[vocab_size, hidden_size], 0.02, device, seed)?;
        Ok(Self { weight })
    }
}

impl Layer for OutputHead {
    fn name(&self) -> &str {
        "output_head"
    }

    fn forward(&self, input: &Tensor, _batch: &Batch) -> Result<Tensor, PretrainError> {
        let projection = self
            .weight
            .as_tensor()
            .t()
            .map_err(to_runtime_error)?;
        input
            .broadcast_matmul(&projection)
            .map_err(to_runtime_error)
    }

    fn parameters(&self) -> Vec<NamedParameter> {
        vec![NamedParameter {
            name: "output_head.weight".to_string(),
            var: self.weight.clone(),
            trainable: true,
            model_parallel: false,
        }]
    }
}

/// The model surface the training engine drives. Forward consumes a
/// full batch and yields `[batch, seq, vocab]` logits aligned with the
/// batch labels.
pub trait Model: Send {
    fn forward(&self, batch: &Batch) -> Result<Tensor, PretrainError>;

    fn named_parameters(&self) -> Vec<NamedParameter>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;
}

/// Flat layer stack. Pipeline-parallel deployments wrap their stages
/// behind a `PipelineEngine` instead; this is the single-engine form
/// everything else runs on.
pub struct SequentialModel {
    layers: Vec<Box<dyn Layer>>,
    /// When set, only parameters whose name contains this substring
    /// stay trainable.
    trainable_filter: Option<String>,
    /// Number of soft-prompt positions to slice off the logits so
    /// they line up with the labels again.
    prompt_prefix_len: usize,
    training: bool,
}

impl SequentialModel {
    pub fn new(layers: Vec<Box<dyn Layer>>) -> Self {
        Self {
            layers,
            trainable_filter: None,
            prompt_prefix_len: 0,
            training: true,
        }
    }

    pub fn insert_layer(&mut self, index: usize, layer: Box<dyn Layer>) {
        self.layers.insert(index, layer);
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    /// Restricts training to parameters whose name contains `tag`.
    pub fn freeze_except(&mut self, tag: &str) {
        self.trainable_filter = Some(tag.to_string());
    }

    fn set_prompt_prefix_len(&mut self, len: usize) {
        self.prompt_prefix_len = len;
    }
}

impl Model for SequentialModel {
    fn forward(&self, batch: &Batch) -> Result<Tensor, PretrainError> {
        let mut hidden = batch.tokens.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden, batch)?;
        }
        if self.prompt_prefix_len > 0 {
            let (_, total_len, _) = hidden.dims3().map_err(to_runtime_error)?;
            let seq_len = total_len.checked_sub(self.prompt_prefix_len).ok_or_else(|| {
                PretrainError::runtime(
                    "soft prompt prefix longer than the produced logit sequence",
                )
            })?;
            hidden = hidden
                .narrow(1, self.prompt_prefix_len, seq_len)
                .map_err(to_runtime_error)?;
        }
        Ok(hidden)
    }

    fn named_parameters(&self) -> Vec<NamedParameter> {
        let mut parameters = Vec::new();
        for layer in &self.layers {
            for mut parameter in layer.parameters() {
                if let Some(filter) = &self.trainable_filter {
                    parameter.trainable = parameter.name.contains(filter.as_str());
                }
                parameters.push(parameter);
            }
        }
        parameters
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }
}

/// Builds the base embedding/head stack and applies soft-prompt tuning
/// when configured: the prompt layer lands right after the word
/// embedding and every other parameter is frozen.
pub fn build_model(
    config: &PretrainConfig,
    device: &Device,
    encoder: Option<&dyn TokenEncoder>,
) -> Result<SequentialModel, PretrainError> {
    let seed = config.runtime.seed;
    let embedding = WordEmbedding::new(
        config.model.vocab_size,
        config.model.hidden_size,
        device,
        seed,
    )?;

    let soft_prompt = if config.soft_prompt_tuning.enabled {
        let init_tokens = match (&config.soft_prompt_tuning.init_string, encoder) {
            (text, Some(encoder)) if !text.is_empty() => encoder.encode(text)?,
            (text, None) if !text.is_empty() => {
                return Err(PretrainError::initialization(
                    "soft prompt init_string set but no token encoder supplied",
                ));
            }
            _ => Vec::new(),
        };
        Some(SoftEmbedding::new(
            &embedding,
            config.soft_prompt_tuning.n_tokens,
            &init_tokens,
            config.soft_prompt_tuning.init_range,
            device,
            seed.wrapping_add(1),
        )?)
    } else {
        None
    };

    let head = OutputHead::new(
        config.model.vocab_size,
        config.model.hidden_size,
        device,
        seed.wrapping_add(2),
    )?;

    let mut model = SequentialModel::new(vec![Box::new(embedding), Box::new(head)]);
    if let Some(soft_prompt) = soft_prompt {
        let prefix_len = soft_prompt.n_tokens();
        model.insert_layer(1, Box::new(soft_prompt));
        model.set_prompt_prefix_len(prefix_len);
        model.freeze_except(SOFT_EMBEDDING_TAG);
    }
    Ok(model)
}

fn uniform_var(
    shape: &[usize],
    range: f64,
    device: &Device,
    seed: u64,
) -> Result<Var, PretrainError> {
    let count: usize = shape.iter().product();
    let mut rng = StdRng::seed_from_u64(seed);
    let data: Vec<f32> = (0..count)
        .map(|_| (rng.gen::<f64>() * 2.0 - 1.0) as f32 * range as f32)
        .collect();
    let tensor = Tensor::from_vec(data, shape, device)
        .map_err(to_runtime_error)?
        .to_dtype(DType::F32)
        .map_err(to_runtime_error)?;
    Var::from_tensor(&tensor).map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> PretrainError {
    PretrainError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DataConfig, ModelConfig, OptimizerConfig, RuntimeConfig, SchedulerConfig,
        SoftPromptConfig,
    };

    fn test_config(soft_prompt: bool) -> PretrainConfig {
        PretrainConfig {
            model: ModelConfig {
                vocab_size: 16,
                hidden_size: 4,
            },
            data: DataConfig {
                seq_len: 3,
                micro_batch_size: 1,
                eod_token_id: 0,
                eod_mask_loss: false,
                train_tokens: None,
                valid_tokens: None,
            },
            optimizer: OptimizerConfig::default(),
            scheduler: SchedulerConfig::default(),
            runtime: RuntimeConfig {
                train_iters: 1,
                gradient_accumulation_steps: 1,
                save_interval: None,
                eval_interval: None,
                exit_interval: None,
                eval_iters: 1,
                log_interval: 1,
                precision: Default::default(),
                no_load_optim: false,
                is_pipe_parallel: false,
                seed: 7,
                overflow_skip_limit: 50,
                max_grad_norm: None,
                log_gradient_noise_scale: false,
                char_level_ppl: false,
                eval_tasks: Vec::new(),
                checkpoint: Default::default(),
                logging: Default::default(),
            },
            soft_prompt_tuning: SoftPromptConfig {
                enabled: soft_prompt,
                n_tokens: 2,
                init_string: String::new(),
                init_range: 0.5,
            },
        }
    }

    fn sample_batch() -> Batch {
        let raw = Tensor::from_slice(&[1u32, 2, 3, 4], (1, 4), &Device::Cpu).unwrap();
        Batch::from_raw(&raw, &test_config(false).data).unwrap()
    }

    #[test]
    fn forward_shapes_line_up_with_labels() {
        let model = build_model(&test_config(false), &Device::Cpu, None).unwrap();
        let logits = model.forward(&sample_batch()).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 16]);
    }

    #[test]
    fn soft_prompt_prefix_is_sliced_off_the_logits() {
        let model = build_model(&test_config(true), &Device::Cpu, None).unwrap();
        assert_eq!(model.layer_count(), 3);
        let logits = model.forward(&sample_batch()).unwrap();
        assert_eq!(logits.dims(), &[1, 3, 16]);
    }

    #[test]
    fn parameters_default_to_replicated() {
        let model = build_model(&test_config(false), &Device::Cpu, None).unwrap();
        let parameters = model.named_parameters();
        assert!(!parameters.is_empty());
        assert!(parameters.iter().all(|p| !p.model_parallel));
    }

    #[test]
    fn soft_prompt_freezes_everything_else() {
        let model = build_model(&test_config(true), &Device::Cpu, None).unwrap();
        let parameters = model.named_parameters();
        let trainable: Vec<&str> = parameters
            .iter()
            .filter(|p| p.trainable)
            .map(|p| p.name.as_str())
            .collect();
        assert_eq!(trainable, vec!["soft_embedding.prompt"]);
        assert!(parameters.len() > trainable.len());
    }

    #[test]
    fn init_string_seeds_the_prompt_from_embedding_rows() {
        let mut config = test_config(true);
        config.soft_prompt_tuning.init_string = "seed".to_string();
        let encoder = |_: &str| vec![3u32, 5];
        let model = build_model(&config, &Device::Cpu, Some(&encoder)).unwrap();

        let params = model.named_parameters();
        let prompt = params
            .iter()
            .find(|p| p.name == "soft_embedding.prompt")
            .unwrap();
        let embedding = params
            .iter()
            .find(|p| p.name == "word_embedding.weight")
            .unwrap();

        let prompt_rows = prompt.var.as_tensor().to_vec2::<f32>().unwrap();
        let table = embedding.var.as_tensor().to_vec2::<f32>().unwrap();
        assert_eq!(prompt_rows[0], table[3]);
        assert_eq!(prompt_rows[1], table[5]);
    }

    #[test]
    fn init_string_without_encoder_fails_setup() {
        let mut config = test_config(true);
        config.soft_prompt_tuning.init_string = "seed".to_string();
        assert!(build_model(&config, &Device::Cpu, None).is_err());
    }
}
