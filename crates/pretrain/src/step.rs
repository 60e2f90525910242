use candle_core::backprop::GradStore;

use crate::{
    batch::next_batch,
    config::PretrainConfig,
    data::DataIterator,
    loss::{masked_cross_entropy, LossDict, LM_LOSS_KEY},
    model::{Model, NamedParameter},
    optimizer::{tensor_l2_norm, GradientScaler, LossScaleConfig, OptimizerHandle},
    parallel::ParallelGroup,
    PretrainError,
};

/// Result of one training iteration.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub losses: LossDict,
    /// True when the update was dropped because the scaled gradients
    /// overflowed.
    pub skipped: bool,
    /// Global gradient norm of the applied update, absent on skips and
    /// in pipeline mode.
    pub grad_norm: Option<f64>,
}

/// Engine owned by a pipeline-parallel deployment. It holds its own
/// copy of the model stages and its own optimizer, so the step engine
/// only forwards batches to it.
pub trait PipelineEngine: Send {
    fn train_batch(&mut self, data: &mut dyn DataIterator) -> Result<StepOutcome, PretrainError>;

    fn eval_batch(&mut self, data: &mut dyn DataIterator) -> Result<LossDict, PretrainError>;
}

/// Runs training iterations. In manual mode one iteration is one
/// accumulation window: gradients from every micro-batch are merged
/// and the optimizer is applied exactly once, at the window's end.
pub struct StepEngine {
    pipeline: Option<Box<dyn PipelineEngine>>,
    scaler: GradientScaler,
    gradient_accumulation_steps: usize,
}

impl StepEngine {
    pub fn new(
        config: &PretrainConfig,
        pipeline: Option<Box<dyn PipelineEngine>>,
    ) -> Result<Self, PretrainError> {
        if config.runtime.is_pipe_parallel && pipeline.is_none() {
            return Err(PretrainError::initialization(
                "pipe-parallel runs need a pipeline engine",
            ));
        }
        if !config.runtime.is_pipe_parallel && pipeline.is_some() {
            return Err(PretrainError::initialization(
                "a pipeline engine was supplied but the run is not pipe-parallel",
            ));
        }
        Ok(Self {
            pipeline,
            scaler: GradientScaler::with_config(
                LossScaleConfig::default(),
                config.runtime.precision,
            ),
            gradient_accumulation_steps: config.runtime.gradient_accumulation_steps,
        })
    }

    pub fn is_pipeline(&self) -> bool {
        self.pipeline.is_some()
    }

    pub fn loss_scale(&self) -> f32 {
        self.scaler.loss_scale()
    }

    pub fn scaler(&self) -> &GradientScaler {
        &self.scaler
    }

    pub fn scaler_mut(&mut self) -> &mut GradientScaler {
        &mut self.scaler
    }

    pub fn train_step(
        &mut self,
        model: &mut dyn Model,
        optimizer: &mut OptimizerHandle,
        data: Option<&mut (dyn DataIterator + '_)>,
        group: &dyn ParallelGroup,
        config: &PretrainConfig,
    ) -> Result<StepOutcome, PretrainError> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            let data = data.ok_or_else(|| {
                PretrainError::runtime("pipeline training step requires a data iterator")
            })?;
            return pipeline.train_batch(data);
        }
        self.train_step_manual(model, optimizer, data, group, config)
    }

    fn train_step_manual(
        &mut self,
        model: &mut dyn Model,
        optimizer: &mut OptimizerHandle,
        mut data: Option<&mut (dyn DataIterator + '_)>,
        group: &dyn ParallelGroup,
        config: &PretrainConfig,
    ) -> Result<StepOutcome, PretrainError> {
        let parameters = model.named_parameters();
        let micro_batches = self.gradient_accumulation_steps;
        let mut window: Option<GradStore> = None;
        let mut loss_sum = 0.0;

        for _ in 0..micro_batches {
            let batch = next_batch(data.as_deref_mut(), group, &config.data)?.ok_or_else(
                || PretrainError::data("data iterator exhausted inside an accumulation window"),
            )?;

            let logits = model.forward(&batch)?;
            let loss = masked_cross_entropy(&logits, &batch)?;
            loss_sum += loss.loss_value;

            // Backward on the scaled mean-per-window loss so the merged
            // gradients come out already averaged over the window.
            let scaled = self
                .scaler
                .scale(&loss.loss)?
                .affine(1.0 / micro_batches as f64, 0.0)
                .map_err(to_runtime_error)?;
            let grads = scaled.backward().map_err(to_runtime_error)?;

            window = Some(match window.take() {
                None => grads,
                Some(merged) => merge_grads(merged, grads, &parameters)?,
            });
        }

        let mut window = window.ok_or_else(|| {
            PretrainError::runtime("accumulation window produced no gradients")
        })?;

        let scaled_grads: Vec<_> = parameters
            .iter()
            .filter_map(|p| window.get(p.var.as_tensor()))
            .collect();
        let found_inf = self.scaler.has_overflow(scaled_grads)?;
        self.scaler.update(found_inf);

        let mut losses = LossDict::new();
        let mut reduced = [loss_sum / micro_batches as f64];
        group.all_reduce_mean(&mut reduced)?;
        losses.insert(LM_LOSS_KEY.to_string(), reduced[0]);

        let local = optimizer.as_local_mut().ok_or_else(|| {
            PretrainError::runtime("manual training step requires a local optimizer")
        })?;

        if found_inf {
            // Discard the whole window; the backoff already happened in
            // the scaler update above.
            local.zero_grad(&mut window);
            return Ok(StepOutcome {
                losses,
                skipped: true,
                grad_norm: None,
            });
        }

        let mut grad_norm_sq = 0.0;
        for parameter in &parameters {
            if let Some(grad) = window.remove(parameter.var.as_tensor()) {
                let unscaled = self.scaler.unscale(&grad)?;
                grad_norm_sq += tensor_l2_norm(&unscaled)?.powi(2);
                window.insert(parameter.var.as_tensor(), unscaled);
            }
        }

        local.step(&mut window)?;

        Ok(StepOutcome {
            losses,
            skipped: false,
            grad_norm: Some(grad_norm_sq.sqrt()),
        })
    }

    /// One evaluation iteration: forward-only losses averaged over the
    /// window's micro-batches (pipeline engines handle their own
    /// micro-batching and run once).
    pub fn eval_step(
        &mut self,
        model: &dyn Model,
        mut data: Option<&mut (dyn DataIterator + '_)>,
        group: &dyn ParallelGroup,
        config: &PretrainConfig,
    ) -> Result<LossDict, PretrainError> {
        if let Some(pipeline) = self.pipeline.as_mut() {
            let data = data.ok_or_else(|| {
                PretrainError::runtime("pipeline evaluation requires a data iterator")
            })?;
            return pipeline.eval_batch(data);
        }

        let micro_batches = self.gradient_accumulation_steps;
        let mut loss_sum = 0.0;
        for _ in 0..micro_batches {
            let batch = next_batch(data.as_deref_mut(), group, &config.data)?
                .ok_or_else(|| PretrainError::data("evaluation data iterator exhausted"))?;
            let logits = model.forward(&batch)?;
            let loss = masked_cross_entropy(&logits.detach(), &batch)?;
            loss_sum += loss.loss_value;
        }

        let mut reduced = [loss_sum / micro_batches as f64];
        group.all_reduce_mean(&mut reduced)?;
        let mut losses = LossDict::new();
        losses.insert(LM_LOSS_KEY.to_string(), reduced[0]);
        Ok(losses)
    }
}

fn merge_grads(
    mut merged: GradStore,
    mut fresh: GradStore,
    parameters: &[NamedParameter],
) -> Result<GradStore, PretrainError> {
    for parameter in parameters {
        let tensor = parameter.var.as_tensor();
        if let Some(grad) = fresh.remove(tensor) {
            let combined = match merged.remove(tensor) {
                Some(prev) => prev.add(&grad).map_err(to_runtime_error)?,
                None => grad,
            };
            merged.insert(tensor, combined);
        }
    }
    Ok(merged)
}

fn to_runtime_error(err: candle_core::Error) -> PretrainError {
    PretrainError::runtime(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Precision, data::TokenStream, model::build_model, optimizer::build_optimizer,
        parallel::SingleProcess,
    };
    use candle_core::{Device, Tensor};

    fn test_config(gas: usize) -> PretrainConfig {
        let toml_src = format!(
            r#"
            [model]
            vocab_size = 16
            hidden_size = 4

            [data]
            seq_len = 4
            micro_batch_size = 2

            [optimizer]
            learning_rate = 0.01

            [runtime]
            train_iters = 4
            gradient_accumulation_steps = {gas}
        "#
        );
        toml::from_str(&toml_src).unwrap()
    }

    fn stream(config: &PretrainConfig) -> TokenStream {
        let tokens: Vec<u32> = (0..256).map(|i| i % 16).collect();
        TokenStream::new(
            tokens,
            config.data.micro_batch_size,
            config.data.seq_len,
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn manual_step_updates_parameters_once_per_window() {
        let config = test_config(3);
        let mut model = build_model(&config, &Device::Cpu, None).unwrap();
        let mut optimizer = build_optimizer(&config, &model.named_parameters()).unwrap();
        let mut engine = StepEngine::new(&config, None).unwrap();
        let mut data = stream(&config);
        let group = SingleProcess;

        let before = model.named_parameters()[0]
            .var
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        let outcome = engine
            .train_step(
                &mut model,
                &mut optimizer,
                Some(&mut data),
                &group,
                &config,
            )
            .unwrap();
        assert!(!outcome.skipped);
        assert!(outcome.losses[LM_LOSS_KEY] > 0.0);
        assert!(outcome.grad_norm.unwrap() > 0.0);

        let after = model.named_parameters()[0]
            .var
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        assert_ne!(before, after);

        // One optimizer update for the whole three-micro-batch window.
        let state = optimizer.as_local().unwrap().state().unwrap();
        assert_eq!(state.step, 1);
    }

    #[test]
    fn overflowed_window_is_skipped_and_backs_off_the_scale() {
        let mut config = test_config(1);
        config.runtime.precision = Precision::Fp16;
        let mut model = build_model(&config, &Device::Cpu, None).unwrap();
        let mut optimizer = build_optimizer(&config, &model.named_parameters()).unwrap();
        let mut engine = StepEngine::new(&config, None).unwrap();
        let mut data = stream(&config);

        // Poison the embedding so the window's gradients come out
        // non-finite, the way an overflowed fp16 step does.
        let parameters = model.named_parameters();
        let embedding = parameters
            .iter()
            .find(|p| p.name == "word_embedding.weight")
            .unwrap();
        let dims = embedding.var.as_tensor().dims().to_vec();
        let poisoned =
            Tensor::full(f32::INFINITY, dims.as_slice(), &Device::Cpu).unwrap();
        embedding.var.set(&poisoned).unwrap();

        let head_before = parameters
            .iter()
            .find(|p| p.name == "output_head.weight")
            .unwrap()
            .var
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();

        let scale_before = engine.loss_scale();
        let outcome = engine
            .train_step(
                &mut model,
                &mut optimizer,
                Some(&mut data),
                &SingleProcess,
                &config,
            )
            .unwrap();
        assert!(outcome.skipped);
        assert!(outcome.grad_norm.is_none());
        assert!(engine.loss_scale() < scale_before);

        // The whole window was discarded: no parameter moved and the
        // optimizer never counted a step.
        let head_after = model
            .named_parameters()
            .into_iter()
            .find(|p| p.name == "output_head.weight")
            .unwrap()
            .var
            .as_tensor()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(head_before, head_after);
        let state = optimizer.as_local().unwrap().state().unwrap();
        assert_eq!(state.step, 0);
    }

    #[test]
    fn manual_step_without_local_optimizer_fails() {
        let config = test_config(1);
        let mut model = build_model(&config, &Device::Cpu, None).unwrap();
        let mut optimizer = OptimizerHandle::Disabled;
        let mut engine = StepEngine::new(&config, None).unwrap();
        let mut data = stream(&config);

        let result = engine.train_step(
            &mut model,
            &mut optimizer,
            Some(&mut data),
            &SingleProcess,
            &config,
        );
        assert!(result.is_err());
    }

    #[test]
    fn eval_step_averages_over_the_window() {
        let config = test_config(2);
        let mut model = build_model(&config, &Device::Cpu, None).unwrap();
        model.set_training(false);
        let mut engine = StepEngine::new(&config, None).unwrap();
        let mut data = stream(&config);

        let losses = engine
            .eval_step(&model, Some(&mut data), &SingleProcess, &config)
            .unwrap();
        assert!(losses[LM_LOSS_KEY] > 0.0);
    }

    #[test]
    fn pipeline_flag_and_engine_must_agree() {
        let mut config = test_config(1);
        config.runtime.is_pipe_parallel = true;
        assert!(StepEngine::new(&config, None).is_err());
    }
}
