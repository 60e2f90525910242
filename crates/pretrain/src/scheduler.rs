use serde::{Deserialize, Serialize};

use crate::{
    config::{LrDecayStyle, PretrainConfig},
    optimizer::{Optimizer, OptimizerHandle},
    PretrainError,
};

/// Warmup-then-decay learning rate schedule. The iteration counter
/// advances once per trusted optimizer update; overflow-skipped steps
/// leave it alone.
#[derive(Debug, Clone)]
pub struct AnnealingLr {
    start_lr: f64,
    min_lr: f64,
    warmup_iters: f64,
    total_iters: usize,
    decay_style: LrDecayStyle,
    num_iters: usize,
    override_checkpoint_values: bool,
    use_checkpoint_values: bool,
}

/// Serializable schedule snapshot for checkpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerState {
    pub start_lr: f64,
    pub min_lr: f64,
    pub warmup_iters: f64,
    pub total_iters: usize,
    pub decay_style: String,
    pub num_iters: usize,
}

impl AnnealingLr {
    pub fn new(
        start_lr: f64,
        min_lr: f64,
        warmup_iters: f64,
        total_iters: usize,
        decay_style: LrDecayStyle,
        override_checkpoint_values: bool,
        use_checkpoint_values: bool,
    ) -> Self {
        Self {
            start_lr,
            min_lr,
            warmup_iters,
            total_iters: total_iters.max(1),
            decay_style,
            num_iters: 0,
            override_checkpoint_values,
            use_checkpoint_values,
        }
    }

    pub fn num_iters(&self) -> usize {
        self.num_iters
    }

    pub fn warmup_iters(&self) -> f64 {
        self.warmup_iters
    }

    pub fn total_iters(&self) -> usize {
        self.total_iters
    }

    /// Learning rate at the current iteration count.
    pub fn get_lr(&self) -> f64 {
        let num_iters = self.num_iters as f64;
        if self.warmup_iters > 0.0 && num_iters <= self.warmup_iters {
            return self.start_lr * num_iters / self.warmup_iters;
        }

        let progress = (num_iters / self.total_iters as f64).min(1.0);
        let lr = match self.decay_style {
            LrDecayStyle::Constant => self.start_lr,
            LrDecayStyle::Linear => self.start_lr * (1.0 - progress),
            LrDecayStyle::Cosine => {
                self.min_lr
                    + (self.start_lr - self.min_lr) / 2.0
                        * ((std::f64::consts::PI * progress).cos() + 1.0)
            }
            LrDecayStyle::Exponential => {
                let floor_ratio = if self.min_lr > 0.0 {
                    self.min_lr / self.start_lr
                } else {
                    1e-2
                };
                self.start_lr * floor_ratio.powf(progress)
            }
        };
        lr.max(self.min_lr)
    }

    /// Advances one iteration and pushes the new rate into the
    /// optimizer.
    pub fn step(&mut self, optimizer: &mut dyn Optimizer) {
        self.num_iters += 1;
        optimizer.set_learning_rate(self.get_lr());
    }

    /// Replays the schedule to an absolute iteration, used after a
    /// checkpoint restore.
    pub fn step_to(&mut self, num_iters: usize, optimizer: &mut dyn Optimizer) {
        self.num_iters = num_iters;
        optimizer.set_learning_rate(self.get_lr());
    }

    pub fn snapshot(&self) -> SchedulerState {
        SchedulerState {
            start_lr: self.start_lr,
            min_lr: self.min_lr,
            warmup_iters: self.warmup_iters,
            total_iters: self.total_iters,
            decay_style: self.decay_style.as_str().to_string(),
            num_iters: self.num_iters,
        }
    }

    /// Reconciles checkpoint values with the configured ones. With
    /// `override_checkpoint_values` the config wins, with
    /// `use_checkpoint_values` the checkpoint wins, otherwise any
    /// disagreement is an error. The iteration count always comes from
    /// the checkpoint.
    pub fn load_state(&mut self, state: &SchedulerState) -> Result<(), PretrainError> {
        if !self.override_checkpoint_values {
            if self.use_checkpoint_values {
                self.start_lr = state.start_lr;
                self.min_lr = state.min_lr;
                self.warmup_iters = state.warmup_iters;
                self.total_iters = state.total_iters.max(1);
                self.decay_style = state.decay_style.parse()?;
            } else {
                self.check_matches(state)?;
            }
        }
        self.num_iters = state.num_iters;
        Ok(())
    }

    fn check_matches(&self, state: &SchedulerState) -> Result<(), PretrainError> {
        let mismatch = |field: &str| {
            PretrainError::runtime(format!(
                "scheduler '{}' differs between the config and the checkpoint; set \
                 override_lr_scheduler or use_checkpoint_lr_scheduler to resolve",
                field
            ))
        };
        if (self.start_lr - state.start_lr).abs() > f64::EPSILON {
            return Err(mismatch("start_lr"));
        }
        if (self.min_lr - state.min_lr).abs() > f64::EPSILON {
            return Err(mismatch("min_lr"));
        }
        if (self.warmup_iters - state.warmup_iters).abs() > f64::EPSILON {
            return Err(mismatch("warmup_iters"));
        }
        if self.total_iters != state.total_iters {
            return Err(mismatch("total_iters"));
        }
        if self.decay_style.as_str() != state.decay_style {
            return Err(mismatch("decay_style"));
        }
        Ok(())
    }
}

/// Builds the schedule for a run. Disabled and deferred optimizers get
/// no local schedule; the decay horizon falls back to `train_iters`
/// when `lr_decay_iters` is unset.
pub fn build_scheduler(
    config: &PretrainConfig,
    optimizer: &OptimizerHandle,
) -> Option<AnnealingLr> {
    match optimizer {
        OptimizerHandle::Disabled | OptimizerHandle::Deferred => None,
        OptimizerHandle::Local(_) => {
            let total_iters = config
                .scheduler
                .lr_decay_iters
                .unwrap_or(config.runtime.train_iters)
                .max(1);
            let warmup_iters = config.scheduler.warmup * total_iters as f64;
            Some(AnnealingLr::new(
                config.optimizer.learning_rate,
                config.scheduler.min_lr,
                warmup_iters,
                total_iters,
                config.scheduler.lr_decay_style,
                config.scheduler.override_lr_scheduler,
                config.scheduler.use_checkpoint_lr_scheduler,
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule(style: LrDecayStyle) -> AnnealingLr {
        AnnealingLr::new(1.0, 0.0, 10.0, 1000, style, false, false)
    }

    #[test]
    fn warmup_ramps_linearly() {
        let mut lr = schedule(LrDecayStyle::Linear);
        assert_eq!(lr.get_lr(), 0.0);
        lr.num_iters = 5;
        assert!((lr.get_lr() - 0.5).abs() < 1e-12);
        lr.num_iters = 10;
        assert!((lr.get_lr() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn linear_decays_to_zero_at_total() {
        let mut lr = schedule(LrDecayStyle::Linear);
        lr.num_iters = 1000;
        assert!(lr.get_lr().abs() < 1e-12);
        lr.num_iters = 2000;
        assert!(lr.get_lr().abs() < 1e-12);
    }

    #[test]
    fn cosine_decreases_monotonically_after_warmup() {
        let mut lr = schedule(LrDecayStyle::Cosine);
        let mut previous = f64::INFINITY;
        for iters in (100..=1000).step_by(100) {
            lr.num_iters = iters;
            let value = lr.get_lr();
            assert!(value < previous);
            previous = value;
        }
    }

    #[test]
    fn constant_holds_after_warmup() {
        let mut lr = schedule(LrDecayStyle::Constant);
        lr.num_iters = 500;
        assert_eq!(lr.get_lr(), 1.0);
    }

    #[test]
    fn min_lr_floors_the_decay() {
        let mut lr = AnnealingLr::new(1.0, 0.25, 0.0, 100, LrDecayStyle::Linear, false, false);
        lr.num_iters = 99;
        assert_eq!(lr.get_lr(), 0.25);
    }

    #[test]
    fn decay_horizon_defaults_to_train_iters() {
        use crate::{model::NamedParameter, optimizer};
        use candle_core::{Device, Tensor, Var};

        let toml_src = r#"
            [model]
            vocab_size = 16
            hidden_size = 4

            [data]
            seq_len = 4

            [scheduler]
            warmup = 0.01

            [runtime]
            train_iters = 1000
        "#;
        let config: crate::config::PretrainConfig = toml::from_str(toml_src).unwrap();

        let tensor = Tensor::zeros((2, 2), candle_core::DType::F32, &Device::Cpu).unwrap();
        let param = NamedParameter {
            name: "w".to_string(),
            var: Var::from_tensor(&tensor).unwrap(),
            trainable: true,
            model_parallel: false,
        };
        let handle = optimizer::build_optimizer(&config, &[param]).unwrap();

        let schedule = build_scheduler(&config, &handle).unwrap();
        assert_eq!(schedule.total_iters(), 1000);
        assert!((schedule.warmup_iters() - 10.0).abs() < 1e-12);
    }

    #[test]
    fn disabled_and_deferred_optimizers_get_no_schedule() {
        let toml_src = r#"
            [model]
            vocab_size = 16
            hidden_size = 4

            [data]
            seq_len = 4

            [runtime]
            train_iters = 100
        "#;
        let config: crate::config::PretrainConfig = toml::from_str(toml_src).unwrap();
        assert!(build_scheduler(&config, &OptimizerHandle::Disabled).is_none());
        assert!(build_scheduler(&config, &OptimizerHandle::Deferred).is_none());
    }

    #[test]
    fn checkpoint_values_win_when_requested() {
        let mut lr = AnnealingLr::new(1.0, 0.0, 10.0, 1000, LrDecayStyle::Cosine, false, true);
        let state = SchedulerState {
            start_lr: 2.0,
            min_lr: 0.1,
            warmup_iters: 20.0,
            total_iters: 500,
            decay_style: "linear".to_string(),
            num_iters: 42,
        };
        lr.load_state(&state).unwrap();
        assert_eq!(lr.num_iters(), 42);
        assert_eq!(lr.total_iters(), 500);
    }

    #[test]
    fn mismatched_state_without_resolution_is_an_error() {
        let mut lr = AnnealingLr::new(1.0, 0.0, 10.0, 1000, LrDecayStyle::Cosine, false, false);
        let mut state = lr.snapshot();
        state.start_lr = 0.5;
        assert!(lr.load_state(&state).is_err());
    }

    #[test]
    fn override_keeps_configured_values() {
        let mut lr = AnnealingLr::new(1.0, 0.0, 10.0, 1000, LrDecayStyle::Cosine, true, false);
        let state = SchedulerState {
            start_lr: 9.0,
            min_lr: 0.5,
            warmup_iters: 1.0,
            total_iters: 7,
            decay_style: "linear".to_string(),
            num_iters: 3,
        };
        lr.load_state(&state).unwrap();
        assert_eq!(lr.num_iters(), 3);
        assert_eq!(lr.total_iters(), 1000);
    }
}
