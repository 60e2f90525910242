use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use candle_core::Device;

use crate::{
    checkpoint::{self, SaveRequest},
    config::PretrainConfig,
    data::{DataIterator, Detokenizer, TokenEncoder},
    evaluate::{evaluate_and_print_results, EvalHarness},
    logging::Logger,
    metrics::{GradientNoiseScale, OverflowMonitor, TrainingMetrics},
    model::{build_model, Model, SequentialModel},
    optimizer::{build_optimizer, OptimizerHandle},
    parallel::{ParallelGroup, SingleProcess},
    scheduler::{build_scheduler, AnnealingLr},
    step::{PipelineEngine, StepEngine},
    PretrainError,
};

/// Everything that mutates over a run. The config never changes; this
/// does, and checkpoints are snapshots of it.
pub struct TrainingState {
    pub iteration: usize,
    pub model: SequentialModel,
    pub optimizer: OptimizerHandle,
    pub scheduler: Option<AnnealingLr>,
}

/// External seams a deployment can plug in. Defaults to a
/// single-process run with no tokenizer, no harness, and no pipeline
/// engine.
#[derive(Default)]
pub struct Collaborators {
    pub group: Option<Box<dyn ParallelGroup>>,
    pub pipeline: Option<Box<dyn PipelineEngine>>,
    pub detokenizer: Option<Box<dyn Detokenizer>>,
    pub encoder: Option<Box<dyn TokenEncoder>>,
    pub harness: Option<Box<dyn EvalHarness>>,
}

/// How a training run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainOutcome {
    /// Ran through `train_iters`.
    Completed { iteration: usize },
    /// Stopped at a configured `exit_interval` boundary.
    EarlyExit { iteration: usize },
    /// Stopped by the shutdown flag.
    Interrupted { iteration: usize },
}

pub struct Trainer {
    config: PretrainConfig,
    device: Device,
    group: Box<dyn ParallelGroup>,
    engine: StepEngine,
    state: TrainingState,
    logger: Logger,
    metrics: TrainingMetrics,
    overflow: OverflowMonitor,
    noise: Option<GradientNoiseScale>,
    detokenizer: Option<Box<dyn Detokenizer>>,
    harness: Option<Box<dyn EvalHarness>>,
    shutdown: Option<Arc<AtomicBool>>,
}

impl Trainer {
    pub fn new(
        config: PretrainConfig,
        device: Device,
        collaborators: Collaborators,
    ) -> Result<Self, PretrainError> {
        config.validate()?;

        let Collaborators {
            group,
            pipeline,
            detokenizer,
            encoder,
            harness,
        } = collaborators;
        let group = group.unwrap_or_else(|| Box::new(SingleProcess));

        let model = build_model(&config, &device, encoder.as_deref())?;
        let optimizer = build_optimizer(&config, &model.named_parameters())?;
        let scheduler = build_scheduler(&config, &optimizer);
        let mut engine = StepEngine::new(&config, pipeline)?;
        let logger = Logger::new(&config.runtime.logging, group.is_rank_zero())?;

        let tokens_per_step = config.data.micro_batch_size
            * config.data.seq_len
            * config.runtime.gradient_accumulation_steps
            * group.world_size();
        let noise = config
            .runtime
            .log_gradient_noise_scale
            .then(|| GradientNoiseScale::new(tokens_per_step));

        let mut state = TrainingState {
            iteration: 0,
            model,
            optimizer,
            scheduler,
        };

        let mut trainer_logger = logger;
        if let Some(load_dir) = config.runtime.checkpoint.load_dir.clone() {
            resume_from_checkpoint(
                &load_dir,
                &device,
                &mut state,
                &mut engine,
                &mut trainer_logger,
            )?;
        }

        Ok(Self {
            overflow: OverflowMonitor::new(config.runtime.overflow_skip_limit),
            config,
            device,
            group,
            engine,
            state,
            logger: trainer_logger,
            metrics: TrainingMetrics::new(),
            noise,
            detokenizer,
            harness,
            shutdown: None,
        })
    }

    pub fn with_shutdown_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.shutdown = Some(flag);
        self
    }

    pub fn iteration(&self) -> usize {
        self.state.iteration
    }

    pub fn config(&self) -> &PretrainConfig {
        &self.config
    }

    pub fn model(&self) -> &SequentialModel {
        &self.state.model
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// The main loop: steps until `train_iters`, honoring the save,
    /// eval, and exit intervals along the way.
    pub fn train(
        &mut self,
        train_data: &mut dyn DataIterator,
        mut valid_data: Option<&mut dyn DataIterator>,
    ) -> Result<TrainOutcome, PretrainError> {
        let mut last_saved_iteration = None;
        let starting_iteration = self.state.iteration;

        while self.state.iteration < self.config.runtime.train_iters {
            if self.shutdown_requested() {
                self.save_if_configured(&mut last_saved_iteration)?;
                self.logger.log_message("shutdown requested, stopping");
                self.logger.flush();
                return Ok(TrainOutcome::Interrupted {
                    iteration: self.state.iteration,
                });
            }

            let outcome = self.engine.train_step(
                &mut self.state.model,
                &mut self.state.optimizer,
                Some(train_data),
                self.group.as_ref(),
                &self.config,
            )?;
            self.state.iteration += 1;

            // The schedule only advances on trusted updates.
            if !outcome.skipped {
                if let (Some(scheduler), Some(local)) = (
                    self.state.scheduler.as_mut(),
                    self.state.optimizer.as_local_mut(),
                ) {
                    scheduler.step(local);
                }
            }
            self.overflow.check(outcome.skipped)?;

            let noise_scale = match (&mut self.noise, outcome.grad_norm) {
                (Some(noise), Some(grad_norm)) => noise.update(grad_norm),
                (Some(noise), None) => noise.estimate(),
                _ => None,
            };

            let tokens = (self.config.data.micro_batch_size
                * self.config.data.seq_len
                * self.config.runtime.gradient_accumulation_steps
                * self.group.world_size()) as u64;
            let lm_loss = outcome
                .losses
                .get(crate::loss::LM_LOSS_KEY)
                .copied()
                .unwrap_or(0.0);
            let snapshot = self.metrics.record_step(tokens, lm_loss);

            if self.state.iteration % self.config.runtime.log_interval == 0 {
                self.logger.log_training_step(
                    self.state.iteration,
                    &outcome.losses,
                    self.state.optimizer.learning_rate(),
                    self.engine.loss_scale(),
                    outcome.skipped,
                    noise_scale,
                    &snapshot,
                );
            }

            if let Some(save_interval) = self.config.runtime.save_interval {
                if self.state.iteration % save_interval == 0 {
                    self.save_if_configured(&mut last_saved_iteration)?;
                }
            }

            if let Some(eval_interval) = self.config.runtime.eval_interval {
                if self.state.iteration % eval_interval == 0 {
                    if let Some(valid) = valid_data.as_deref_mut() {
                        self.run_evaluation("validation", valid)?;
                    }
                }
            }

            if let Some(exit_interval) = self.config.runtime.exit_interval {
                if self.state.iteration % exit_interval == 0 {
                    self.save_if_configured(&mut last_saved_iteration)?;
                    self.group.barrier()?;
                    self.logger.log_message(&format!(
                        "exiting at iteration {}",
                        self.state.iteration
                    ));
                    self.logger.flush();
                    return Ok(TrainOutcome::EarlyExit {
                        iteration: self.state.iteration,
                    });
                }
            }
        }

        // A final save only makes sense when this run actually stepped;
        // restarting an already-finished run writes nothing.
        if self.state.iteration != starting_iteration
            && last_saved_iteration != Some(self.state.iteration)
        {
            self.save_if_configured(&mut last_saved_iteration)?;
        }
        if let Some(valid) = valid_data.as_deref_mut() {
            self.run_evaluation("validation", valid)?;
        }
        self.logger.flush();

        Ok(TrainOutcome::Completed {
            iteration: self.state.iteration,
        })
    }

    pub fn run_evaluation(
        &mut self,
        prefix: &str,
        data: &mut dyn DataIterator,
    ) -> Result<crate::loss::LossDict, PretrainError> {
        evaluate_and_print_results(
            prefix,
            self.state.iteration,
            &mut self.state.model,
            &mut self.engine,
            Some(data),
            self.group.as_ref(),
            &self.config,
            self.detokenizer.as_deref(),
            self.harness.as_deref_mut(),
            &mut self.logger,
        )
    }

    fn save_if_configured(
        &mut self,
        last_saved_iteration: &mut Option<usize>,
    ) -> Result<(), PretrainError> {
        let Some(save_dir) = self.config.runtime.checkpoint.save_dir.clone() else {
            return Ok(());
        };
        if *last_saved_iteration == Some(self.state.iteration) {
            return Ok(());
        }
        // All ranks hold identical replicas here; rank zero writes.
        if self.group.is_rank_zero() {
            checkpoint::save_checkpoint(SaveRequest {
                base_dir: &save_dir,
                config: &self.config,
                model: &self.state.model,
                optimizer: &self.state.optimizer,
                scheduler: self.state.scheduler.as_ref(),
                scaler: self.engine.scaler(),
                iteration: self.state.iteration,
                max_keep: self.config.runtime.checkpoint.max_keep,
            })?;
        }
        self.group.barrier()?;
        *last_saved_iteration = Some(self.state.iteration);
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

fn resume_from_checkpoint(
    load_dir: &std::path::Path,
    device: &Device,
    state: &mut TrainingState,
    engine: &mut StepEngine,
    logger: &mut Logger,
) -> Result<(), PretrainError> {
    let descriptor = match checkpoint::latest_checkpoint(load_dir)? {
        Some(descriptor) => descriptor,
        None if load_dir.join("manifest.json").is_file() => checkpoint::CheckpointDescriptor {
            directory: load_dir.to_path_buf(),
            manifest: checkpoint::load_checkpoint(load_dir)?.manifest,
        },
        None => {
            logger.log_message(&format!(
                "no checkpoint found under {}, starting from scratch",
                load_dir.display()
            ));
            return Ok(());
        }
    };

    let outcome = checkpoint::load_checkpoint(&descriptor.directory)?;
    checkpoint::apply_model_weights(&state.model, &outcome.model_weights_path, device)?;

    match (state.optimizer.as_local_mut(), outcome.optimizer_state) {
        (Some(local), Some(optimizer_state)) => local.load_state(optimizer_state)?,
        (Some(_), None) => {
            return Err(PretrainError::runtime(
                "checkpoint has no optimizer state but this run expects one",
            ));
        }
        _ => {}
    }

    if let (Some(scheduler), Some(scheduler_state)) =
        (state.scheduler.as_mut(), outcome.scheduler_state.as_ref())
    {
        scheduler.load_state(scheduler_state)?;
        let num_iters = scheduler.num_iters();
        if let Some(local) = state.optimizer.as_local_mut() {
            scheduler.step_to(num_iters, local);
        }
    }

    engine.scaler_mut().load_state(&outcome.scaler_state)?;
    state.iteration = outcome.manifest.iteration;
    logger.log_message(&format!(
        "resumed from {} at iteration {}",
        descriptor.directory.display(),
        state.iteration
    ));
    Ok(())
}
