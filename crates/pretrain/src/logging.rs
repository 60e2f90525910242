use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    loss::LossDict,
    metrics::{resident_memory_bytes, StepSnapshot},
    PretrainError,
};

/// Run logger. Stdout lines and TensorBoard events are emitted on
/// rank zero only; other ranks get a silent logger.
pub struct Logger {
    stdout: bool,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(config: &LoggingConfig, is_rank_zero: bool) -> Result<Self, PretrainError> {
        if !is_rank_zero {
            return Ok(Self {
                stdout: false,
                tensorboard: None,
            });
        }
        let tensorboard = match config.tensorboard_dir.as_ref() {
            Some(dir) => Some(TensorBoardWriter::create(
                dir,
                config.tensorboard_flush_every_n,
            )?),
            None => None,
        };
        Ok(Self {
            stdout: config.enable_stdout,
            tensorboard,
        })
    }

    pub fn silent() -> Self {
        Self {
            stdout: false,
            tensorboard: None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_training_step(
        &mut self,
        iteration: usize,
        losses: &LossDict,
        lr: f64,
        loss_scale: f32,
        skipped: bool,
        noise_scale: Option<f64>,
        snapshot: &StepSnapshot,
    ) {
        if self.stdout {
            let lm_loss = losses.get(crate::loss::LM_LOSS_KEY).copied().unwrap_or(0.0);
            let mut line = format!(
                "iteration {:>8} | lm_loss {:.4e} | lr {:.4e} | loss_scale {:.1} | tok/s {:.1}",
                iteration, lm_loss, lr, loss_scale, snapshot.tokens_per_sec
            );
            if skipped {
                line.push_str(" | skipped");
            }
            if let Some(noise) = noise_scale {
                line.push_str(&format!(" | noise_scale {:.3e}", noise));
            }
            if let Some(bytes) = resident_memory_bytes() {
                line.push_str(&format!(" | rss {:.1}MiB", bytes as f64 / (1024.0 * 1024.0)));
            }
            println!("{}", line);
        }

        if let Some(writer) = self.tensorboard.as_mut() {
            let step = iteration as i64;
            for (key, value) in losses {
                let _ = writer.write_scalar(&format!("train/{}", key), step, *value);
            }
            let _ = writer.write_scalar("train/learning_rate", step, lr);
            let _ = writer.write_scalar("train/loss_scale", step, loss_scale as f64);
            let _ = writer.write_scalar("train/skipped", step, if skipped { 1.0 } else { 0.0 });
            let _ = writer.write_scalar("train/tokens_per_sec", step, snapshot.tokens_per_sec);
            if let Some(noise) = noise_scale {
                let _ = writer.write_scalar("train/noise_scale", step, noise);
            }
        }
    }

    /// Logs one named block of evaluation results, such as
    /// `validation` losses or harness task scores.
    pub fn log_evaluation(&mut self, iteration: usize, prefix: &str, results: &LossDict) {
        if self.stdout {
            let formatted: Vec<String> = results
                .iter()
                .map(|(key, value)| format!("{} {:.4e}", key, value))
                .collect();
            println!(
                "{} results at iteration {} | {}",
                prefix,
                iteration,
                formatted.join(" | ")
            );
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            let step = iteration as i64;
            for (key, value) in results {
                let _ = writer.write_scalar(&format!("{}/{}", prefix, key), step, *value);
            }
        }
    }

    pub fn log_message(&mut self, message: &str) {
        if self.stdout {
            println!("{}", message);
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            let _ = writer.flush();
        }
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, PretrainError> {
        fs::create_dir_all(dir).map_err(|err| {
            PretrainError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            PretrainError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), PretrainError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    // TFRecord framing: length, masked CRC of length, payload, masked
    // CRC of payload.
    fn write_event(&mut self, event: &Event) -> Result<(), PretrainError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            PretrainError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc_bytes = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc_bytes = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc_bytes))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc_bytes))
            .map_err(|err| {
                PretrainError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PretrainError> {
        self.writer.flush().map_err(|err| {
            PretrainError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}
