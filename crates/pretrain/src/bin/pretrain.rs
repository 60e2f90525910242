use std::{
    path::PathBuf,
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use candle_core::Device;
use clap::Parser;
use pretrain::{
    Collaborators, PretrainConfig, PretrainError, TokenStream, TrainOutcome, Trainer,
};
use serde_json::{Number, Value};

fn main() {
    match run() {
        Ok(outcome) => {
            if let TrainOutcome::EarlyExit { iteration } = outcome {
                println!("stopped at exit interval, iteration {}", iteration);
            }
        }
        Err(err) => {
            eprintln!("pretrain failed: {}", err);
            std::process::exit(1);
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Language model pretraining CLI", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to the run config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override a configuration value using a dot-separated path"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Run on CPU even when an accelerator is available")]
    cpu: bool,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<TrainOutcome, PretrainError> {
    let args = Args::parse();

    let mut config = PretrainConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let device = if args.cpu {
        Device::Cpu
    } else {
        Device::cuda_if_available(0)
            .map_err(|err| PretrainError::initialization(err.to_string()))?
    };

    let train_path = config.data.train_tokens.clone().ok_or_else(|| {
        PretrainError::initialization("data.train_tokens is required for training")
    })?;
    let mut train_data = TokenStream::from_path(
        &train_path,
        config.data.micro_batch_size,
        config.data.seq_len,
        device.clone(),
    )?;
    let mut valid_data = match config.data.valid_tokens.clone() {
        Some(path) => Some(TokenStream::from_path(
            &path,
            config.data.micro_batch_size,
            config.data.seq_len,
            device.clone(),
        )?),
        None => None,
    };

    let shutdown_flag = Arc::new(AtomicBool::new(false));
    let handler_flag = shutdown_flag.clone();
    ctrlc::set_handler(move || {
        handler_flag.store(true, Ordering::SeqCst);
    })
    .map_err(|err| PretrainError::runtime(format!("failed to install signal handler: {err}")))?;

    let mut trainer = Trainer::new(config, device, Collaborators::default())?
        .with_shutdown_flag(shutdown_flag);

    trainer.train(
        &mut train_data,
        valid_data
            .as_mut()
            .map(|data| data as &mut dyn pretrain::DataIterator),
    )
}

/// Applies `--override a.b.c=value` pairs by round-tripping the config
/// through its JSON form.
fn apply_overrides(
    config: PretrainConfig,
    overrides: &[OverrideArg],
) -> Result<PretrainConfig, PretrainError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        PretrainError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        PretrainError::runtime(format!(
            "failed to deserialize config after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

fn set_value_at_path(
    target: &mut Value,
    path: &str,
    new_value: Value,
) -> Result<(), PretrainError> {
    let mut current = target;
    let segments: Vec<&str> = path.split('.').collect();
    for (idx, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return Err(PretrainError::runtime(format!(
                "override path '{}' contains an empty segment",
                path
            )));
        }
        let map = match current {
            Value::Object(map) => map,
            Value::Null => {
                *current = Value::Object(serde_json::Map::new());
                match current {
                    Value::Object(map) => map,
                    _ => unreachable!(),
                }
            }
            _ => {
                return Err(PretrainError::runtime(format!(
                    "override path segment '{}' points at a non-object value",
                    segment
                )));
            }
        };
        let entry = map.entry(segment.to_string()).or_insert(Value::Null);
        if idx + 1 == segments.len() {
            *entry = new_value;
            return Ok(());
        }
        current = entry;
    }
    Ok(())
}
