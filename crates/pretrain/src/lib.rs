//! Training loop for autoregressive transformer language models.
//!
//! The crate is organized around a handful of seams: `DataIterator`
//! feeds raw token blocks, `ParallelGroup` abstracts the collectives,
//! `Model` is what gets trained, and `StepEngine` turns batches into
//! optimizer updates (locally, or through a `PipelineEngine` for
//! pipe-parallel deployments). `Trainer` drives the whole run:
//! scheduling, checkpointing, evaluation, and logging.

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod parallel;
pub mod scheduler;
pub mod step;
pub mod trainer;

pub use batch::{next_batch, Batch};
pub use config::{LrDecayStyle, OptimizerType, Precision, PretrainConfig, PretrainError};
pub use data::{CharCounter, DataIterator, Detokenizer, TokenEncoder, TokenStream};
pub use evaluate::{evaluate, evaluate_and_print_results, EvalHarness};
pub use logging::Logger;
pub use loss::{masked_cross_entropy, LossDict, LM_LOSS_KEY};
pub use metrics::{GradientNoiseScale, OverflowMonitor, TrainingMetrics};
pub use model::{build_model, Model, NamedParameter, SequentialModel, SoftEmbedding};
pub use optimizer::{build_optimizer, GradientScaler, Optimizer, OptimizerHandle};
pub use parallel::{ParallelGroup, SingleProcess};
pub use scheduler::{build_scheduler, AnnealingLr};
pub use step::{PipelineEngine, StepEngine, StepOutcome};
pub use trainer::{Collaborators, TrainOutcome, Trainer, TrainingState};
