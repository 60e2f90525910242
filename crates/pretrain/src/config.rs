use std::{
    fmt, fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Immutable run configuration. Everything that changes during a run
/// (iteration count, parameter totals) lives in `TrainingState`, never
/// here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PretrainConfig {
    pub model: ModelConfig,
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub soft_prompt_tuning: SoftPromptConfig,
}

impl PretrainConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, PretrainError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: PretrainConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(PretrainError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        config.validate()?;

        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PretrainError> {
        Self::from_path(path)
    }

    pub fn validate(&self) -> Result<(), PretrainError> {
        let mut errors = Vec::new();

        if self.model.vocab_size == 0 {
            errors.push("model.vocab_size must be greater than 0".to_string());
        }
        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if self.data.seq_len < 2 {
            errors.push("data.seq_len must be at least 2".to_string());
        }
        if self.data.micro_batch_size == 0 {
            errors.push("data.micro_batch_size must be greater than 0".to_string());
        }
        if self.data.eod_token_id as usize >= self.model.vocab_size {
            errors.push("data.eod_token_id must be inside the vocabulary".to_string());
        }

        if self.optimizer.learning_rate <= 0.0 {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if self.optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be >= 0".to_string());
        }
        if !(0.0 < self.optimizer.beta1 && self.optimizer.beta1 < 1.0) {
            errors.push("optimizer.beta1 must be in (0, 1)".to_string());
        }
        if !(0.0 < self.optimizer.beta2 && self.optimizer.beta2 < 1.0) {
            errors.push("optimizer.beta2 must be in (0, 1)".to_string());
        }

        if !(0.0..=1.0).contains(&self.scheduler.warmup) {
            errors.push("scheduler.warmup must be a fraction in [0, 1]".to_string());
        }
        if self.scheduler.min_lr < 0.0 {
            errors.push("scheduler.min_lr must be >= 0".to_string());
        }
        if self.scheduler.min_lr > self.optimizer.learning_rate {
            errors.push("scheduler.min_lr cannot exceed optimizer.learning_rate".to_string());
        }
        if let Some(0) = self.scheduler.lr_decay_iters {
            errors.push("scheduler.lr_decay_iters must be greater than 0".to_string());
        }
        if self.scheduler.override_lr_scheduler && self.scheduler.use_checkpoint_lr_scheduler {
            errors.push(
                "scheduler.override_lr_scheduler and scheduler.use_checkpoint_lr_scheduler \
                 are mutually exclusive"
                    .to_string(),
            );
        }

        if self.runtime.train_iters == 0 {
            errors.push("runtime.train_iters must be greater than 0".to_string());
        }
        if self.runtime.gradient_accumulation_steps == 0 {
            errors.push("runtime.gradient_accumulation_steps must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.save_interval {
            errors.push("runtime.save_interval must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.eval_interval {
            errors.push("runtime.eval_interval must be greater than 0".to_string());
        }
        if let Some(0) = self.runtime.exit_interval {
            errors.push("runtime.exit_interval must be greater than 0".to_string());
        }
        if self.runtime.log_interval == 0 {
            errors.push("runtime.log_interval must be greater than 0".to_string());
        }
        if self.runtime.overflow_skip_limit == 0 {
            errors.push("runtime.overflow_skip_limit must be greater than 0".to_string());
        }
        if self.runtime.save_interval.is_some() && self.runtime.checkpoint.save_dir.is_none() {
            errors.push(
                "runtime.save_interval requires runtime.checkpoint.save_dir".to_string(),
            );
        }

        if self.soft_prompt_tuning.enabled && self.soft_prompt_tuning.n_tokens == 0 {
            errors.push("soft_prompt_tuning.n_tokens must be greater than 0".to_string());
        }
        if self.soft_prompt_tuning.init_range <= 0.0 {
            errors.push("soft_prompt_tuning.init_range must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(PretrainError::validation(errors));
        }

        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        self.data.apply_base_path(base);
        self.runtime.apply_base_path(base);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Model context length. Raw batches carry `seq_len + 1` tokens.
    pub seq_len: usize,
    #[serde(default = "default_micro_batch_size")]
    pub micro_batch_size: usize,
    /// End-of-document token id, used by the loss mask when
    /// `eod_mask_loss` is set.
    #[serde(default)]
    pub eod_token_id: u32,
    #[serde(default)]
    pub eod_mask_loss: bool,
    #[serde(default)]
    pub train_tokens: Option<PathBuf>,
    #[serde(default)]
    pub valid_tokens: Option<PathBuf>,
}

impl DataConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [self.train_tokens.as_mut(), self.valid_tokens.as_mut()] {
            if let Some(path) = path {
                absolutize_in_place(path, base);
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default, rename = "type")]
    pub optimizer_type: OptimizerType,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default)]
    pub weight_decay: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    /// Momentum used by the MADGRAD variant; ignored elsewhere.
    #[serde(default = "default_momentum")]
    pub momentum: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            optimizer_type: OptimizerType::default(),
            learning_rate: default_learning_rate(),
            weight_decay: 0.0,
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            momentum: default_momentum(),
        }
    }
}

/// Closed optimizer selection. Unknown strings fail at parse time,
/// long before any training step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptimizerType {
    /// Adam with moment state offloaded to host memory.
    CpuAdam,
    /// Same offload path, plain (non-fused) update rule.
    CpuTorchAdam,
    /// Construction is deferred to the distributed engine.
    OneBitAdam,
    /// Memory-efficient SM3.
    Sm3,
    /// Compute-efficient MADGRAD with decoupled weight decay.
    MadgradWd,
    #[default]
    Adam,
}

impl OptimizerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerType::CpuAdam => "cpu_adam",
            OptimizerType::CpuTorchAdam => "cpu_torch_adam",
            OptimizerType::OneBitAdam => "onebitadam",
            OptimizerType::Sm3 => "sm3",
            OptimizerType::MadgradWd => "madgrad_wd",
            OptimizerType::Adam => "adam",
        }
    }
}

impl FromStr for OptimizerType {
    type Err = PretrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu_adam" => Ok(OptimizerType::CpuAdam),
            "cpu_torch_adam" => Ok(OptimizerType::CpuTorchAdam),
            "onebitadam" => Ok(OptimizerType::OneBitAdam),
            "sm3" => Ok(OptimizerType::Sm3),
            "madgrad_wd" => Ok(OptimizerType::MadgradWd),
            "adam" => Ok(OptimizerType::Adam),
            other => Err(PretrainError::validation(vec![format!(
                "optimizer type '{}' not recognized",
                other
            )])),
        }
    }
}

impl Serialize for OptimizerType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for OptimizerType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|_| {
            de::Error::custom(format!("optimizer type '{}' not recognized", raw))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub lr_decay_style: LrDecayStyle,
    /// Iterations over which the learning rate decays; defaults to
    /// `train_iters` when unset.
    #[serde(default)]
    pub lr_decay_iters: Option<usize>,
    /// Warmup duration as a fraction of the decay iterations.
    #[serde(default = "default_warmup")]
    pub warmup: f64,
    #[serde(default)]
    pub min_lr: f64,
    #[serde(default)]
    pub override_lr_scheduler: bool,
    #[serde(default)]
    pub use_checkpoint_lr_scheduler: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lr_decay_style: LrDecayStyle::default(),
            lr_decay_iters: None,
            warmup: default_warmup(),
            min_lr: 0.0,
            override_lr_scheduler: false,
            use_checkpoint_lr_scheduler: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LrDecayStyle {
    Constant,
    Linear,
    #[default]
    Cosine,
    Exponential,
}

impl LrDecayStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            LrDecayStyle::Constant => "constant",
            LrDecayStyle::Linear => "linear",
            LrDecayStyle::Cosine => "cosine",
            LrDecayStyle::Exponential => "exponential",
        }
    }
}

impl FromStr for LrDecayStyle {
    type Err = PretrainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "constant" | "none" => Ok(LrDecayStyle::Constant),
            "linear" => Ok(LrDecayStyle::Linear),
            "cosine" => Ok(LrDecayStyle::Cosine),
            "exponential" => Ok(LrDecayStyle::Exponential),
            other => Err(PretrainError::validation(vec![format!(
                "lr decay style '{}' not recognized",
                other
            )])),
        }
    }
}

impl Serialize for LrDecayStyle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LrDecayStyle {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse()
            .map_err(|_| de::Error::custom(format!("lr decay style '{}' not recognized", raw)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub train_iters: usize,
    #[serde(default = "default_gradient_accumulation_steps")]
    pub gradient_accumulation_steps: usize,
    #[serde(default)]
    pub save_interval: Option<usize>,
    #[serde(default)]
    pub eval_interval: Option<usize>,
    #[serde(default)]
    pub exit_interval: Option<usize>,
    #[serde(default = "default_eval_iters")]
    pub eval_iters: usize,
    #[serde(default = "default_log_interval")]
    pub log_interval: usize,
    #[serde(default)]
    pub precision: Precision,
    /// Skip optimizer/scheduler construction and checkpoint optimizer
    /// state entirely (pure-inference or frozen runs).
    #[serde(default)]
    pub no_load_optim: bool,
    #[serde(default)]
    pub is_pipe_parallel: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Consecutive overflow-skipped iterations tolerated before the
    /// run aborts.
    #[serde(default = "default_overflow_skip_limit")]
    pub overflow_skip_limit: usize,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    #[serde(default)]
    pub log_gradient_noise_scale: bool,
    #[serde(default)]
    pub char_level_ppl: bool,
    #[serde(default)]
    pub eval_tasks: Vec<String>,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    fn apply_base_path(&mut self, base: &Path) {
        for path in [
            self.checkpoint.load_dir.as_mut(),
            self.checkpoint.save_dir.as_mut(),
            self.logging.tensorboard_dir.as_mut(),
        ] {
            if let Some(path) = path {
                absolutize_in_place(path, base);
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default)]
    pub load_dir: Option<PathBuf>,
    #[serde(default)]
    pub save_dir: Option<PathBuf>,
    #[serde(default)]
    pub max_keep: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_true")]
    pub enable_stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
    #[serde(default = "default_flush_every")]
    pub tensorboard_flush_every_n: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable_stdout: true,
            tensorboard_dir: None,
            tensorboard_flush_every_n: default_flush_every(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SoftPromptConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_soft_prompt_tokens")]
    pub n_tokens: usize,
    #[serde(default)]
    pub init_string: String,
    #[serde(default = "default_soft_prompt_init_range")]
    pub init_range: f64,
}

impl Default for SoftPromptConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            n_tokens: default_soft_prompt_tokens(),
            init_string: String::new(),
            init_range: default_soft_prompt_init_range(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    /// Reduced precision; requires dynamic loss scaling and overflow
    /// checks on every step.
    Fp16,
    Bf16,
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_micro_batch_size() -> usize {
    8
}

fn default_learning_rate() -> f64 {
    3e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.95
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_momentum() -> f64 {
    0.9
}

fn default_warmup() -> f64 {
    0.01
}

fn default_gradient_accumulation_steps() -> usize {
    1
}

fn default_eval_iters() -> usize {
    100
}

fn default_log_interval() -> usize {
    100
}

fn default_seed() -> u64 {
    42
}

fn default_overflow_skip_limit() -> usize {
    50
}

fn default_true() -> bool {
    true
}

fn default_flush_every() -> usize {
    20
}

fn default_soft_prompt_tokens() -> usize {
    10
}

fn default_soft_prompt_init_range() -> f64 {
    0.5
}

#[derive(Debug)]
pub enum PretrainError {
    Io(std::io::Error),
    ConfigFormat(String),
    Validation(Vec<String>),
    Initialization(String),
    Data(String),
    Runtime(String),
}

impl PretrainError {
    pub fn initialization(message: impl Into<String>) -> Self {
        Self::Initialization(message.into())
    }

    pub fn data(message: impl Into<String>) -> Self {
        Self::Data(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }

    pub fn validation(messages: Vec<String>) -> Self {
        Self::Validation(messages)
    }
}

impl fmt::Display for PretrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PretrainError::Io(err) => write!(f, "failed to read config: {}", err),
            PretrainError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            PretrainError::Validation(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            PretrainError::Initialization(msg) => {
                write!(f, "setup failed: {}", msg)
            }
            PretrainError::Data(msg) => write!(f, "data error: {}", msg),
            PretrainError::Runtime(msg) => write!(f, "training failed: {}", msg),
        }
    }
}

impl std::error::Error for PretrainError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PretrainError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for PretrainError {
    fn from(value: std::io::Error) -> Self {
        PretrainError::Io(value)
    }
}

impl From<toml::de::Error> for PretrainError {
    fn from(value: toml::de::Error) -> Self {
        PretrainError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for PretrainError {
    fn from(value: serde_json::Error) -> Self {
        PretrainError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optimizer_type_parses_case_insensitively() {
        assert_eq!(
            "OneBitAdam".parse::<OptimizerType>().unwrap(),
            OptimizerType::OneBitAdam
        );
        assert_eq!(
            "CPU_ADAM".parse::<OptimizerType>().unwrap(),
            OptimizerType::CpuAdam
        );
        assert!("adamax".parse::<OptimizerType>().is_err());
    }

    #[test]
    fn decay_style_rejects_unknown_strings() {
        assert_eq!(
            "Cosine".parse::<LrDecayStyle>().unwrap(),
            LrDecayStyle::Cosine
        );
        assert!("triangular".parse::<LrDecayStyle>().is_err());
    }

    #[test]
    fn minimal_toml_round_trip() {
        let toml_src = r#"
            [model]
            vocab_size = 64
            hidden_size = 16

            [data]
            seq_len = 8

            [optimizer]
            type = "sm3"

            [runtime]
            train_iters = 10
        "#;
        let config: PretrainConfig = toml::from_str(toml_src).unwrap();
        config.validate().unwrap();
        assert_eq!(config.optimizer.optimizer_type, OptimizerType::Sm3);
        assert_eq!(config.runtime.gradient_accumulation_steps, 1);

        let serialized = toml::to_string(&config).unwrap();
        let reparsed: PretrainConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(
            reparsed.optimizer.optimizer_type,
            config.optimizer.optimizer_type
        );
    }

    #[test]
    fn conflicting_scheduler_overrides_rejected() {
        let toml_src = r#"
            [model]
            vocab_size = 64
            hidden_size = 16

            [data]
            seq_len = 8

            [scheduler]
            override_lr_scheduler = true
            use_checkpoint_lr_scheduler = true

            [runtime]
            train_iters = 10
        "#;
        let config: PretrainConfig = toml::from_str(toml_src).unwrap();
        assert!(config.validate().is_err());
    }
}
