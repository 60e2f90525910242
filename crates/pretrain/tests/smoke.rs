use std::fs;

use candle_core::Device;
use pretrain::{
    checkpoint::{self, SaveRequest},
    Collaborators, Model, PretrainConfig, TokenStream, TrainOutcome, Trainer,
};

fn base_config(train_iters: usize) -> PretrainConfig {
    let toml_src = format!(
        r#"
        [model]
        vocab_size = 32
        hidden_size = 8

        [data]
        seq_len = 8
        micro_batch_size = 2

        [optimizer]
        type = "adam"
        learning_rate = 0.01

        [scheduler]
        warmup = 0.1
        lr_decay_style = "cosine"

        [runtime]
        train_iters = {train_iters}
        gradient_accumulation_steps = 2
        log_interval = 1

        [runtime.logging]
        enable_stdout = false
    "#
    );
    toml::from_str(&toml_src).expect("config parses")
}

fn token_stream(config: &PretrainConfig) -> TokenStream {
    let tokens: Vec<u32> = (0..2048).map(|i| (i * 7 + 3) % 32).collect();
    TokenStream::new(
        tokens,
        config.data.micro_batch_size,
        config.data.seq_len,
        Device::Cpu,
    )
    .expect("stream builds")
}

#[test]
fn short_run_trains_saves_and_resumes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoint_dir = dir.path().join("checkpoints");

    let mut config = base_config(4);
    config.runtime.save_interval = Some(2);
    config.runtime.checkpoint.save_dir = Some(checkpoint_dir.clone());

    let mut trainer =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("trainer");
    let mut data = token_stream(&config);
    let outcome = trainer.train(&mut data, None).expect("training runs");
    assert_eq!(outcome, TrainOutcome::Completed { iteration: 4 });

    assert!(checkpoint_dir.join("iter_0000002").is_dir());
    assert!(checkpoint_dir.join("iter_0000004").is_dir());

    let final_weights: Vec<Vec<f32>> = trainer
        .model()
        .named_parameters()
        .iter()
        .map(|p| {
            p.var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .collect();
    drop(trainer);

    // Resume for two more iterations from the latest checkpoint. The
    // horizon changed, so the config has to win the scheduler merge.
    let mut config = base_config(6);
    config.runtime.checkpoint.load_dir = Some(checkpoint_dir.clone());
    config.scheduler.override_lr_scheduler = true;
    let mut resumed =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("resume");
    assert_eq!(resumed.iteration(), 4);
    assert_eq!(
        resumed.state().scheduler.as_ref().map(|s| s.num_iters()),
        Some(4),
        "schedule position survives the restore"
    );

    let resumed_weights: Vec<Vec<f32>> = resumed
        .model()
        .named_parameters()
        .iter()
        .map(|p| {
            p.var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .collect();
    assert_eq!(final_weights, resumed_weights, "weights restore exactly");

    let mut data = token_stream(&config);
    let outcome = resumed.train(&mut data, None).expect("resumed run");
    assert_eq!(outcome, TrainOutcome::Completed { iteration: 6 });
}

#[test]
fn checkpoint_round_trip_is_bitwise_exact() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = base_config(2);

    let trainer =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("trainer");
    let scaler = pretrain::GradientScaler::new(config.runtime.precision);
    let descriptor = checkpoint::save_checkpoint(SaveRequest {
        base_dir: dir.path(),
        config: &config,
        model: trainer.model(),
        optimizer: &trainer.state().optimizer,
        scheduler: trainer.state().scheduler.as_ref(),
        scaler: &scaler,
        iteration: 0,
        max_keep: None,
    })
    .expect("save");

    let outcome = checkpoint::load_checkpoint(&descriptor.directory).expect("load");
    assert_eq!(outcome.manifest.iteration, 0);
    assert!(outcome.optimizer_state.is_some());
    assert!(outcome.scheduler_state.is_some());

    // Different seed so the restored weights provably come from the
    // checkpoint rather than from matching initialization.
    let mut fresh_config = config;
    fresh_config.runtime.seed = 99;
    let fresh = Trainer::new(fresh_config, Device::Cpu, Collaborators::default()).expect("fresh");
    checkpoint::apply_model_weights(fresh.model(), &outcome.model_weights_path, &Device::Cpu)
        .expect("weights apply");

    for (saved, restored) in trainer
        .model()
        .named_parameters()
        .iter()
        .zip(fresh.model().named_parameters().iter())
    {
        assert_eq!(saved.name, restored.name);
        let a = saved
            .var
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        let b = restored
            .var
            .as_tensor()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn resuming_a_finished_run_writes_no_new_checkpoint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let first_dir = dir.path().join("first");
    let second_dir = dir.path().join("second");

    let mut config = base_config(2);
    config.runtime.checkpoint.save_dir = Some(first_dir.clone());
    let mut trainer =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("trainer");
    let mut data = token_stream(&config);
    trainer.train(&mut data, None).expect("training runs");
    assert!(first_dir.join("iter_0000002").is_dir());
    drop(trainer);

    // Already at train_iters, so the loop never steps and nothing gets
    // written to the fresh save directory.
    let mut config = base_config(2);
    config.runtime.checkpoint.load_dir = Some(first_dir);
    config.runtime.checkpoint.save_dir = Some(second_dir.clone());
    let mut resumed =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("resume");
    assert_eq!(resumed.iteration(), 2);

    let mut data = token_stream(&config);
    let outcome = resumed.train(&mut data, None).expect("restarted run");
    assert_eq!(outcome, TrainOutcome::Completed { iteration: 2 });
    assert!(!second_dir.exists());
}

#[test]
fn pruning_keeps_only_the_newest_checkpoints() {
    let dir = tempfile::tempdir().expect("tempdir");
    let checkpoint_dir = dir.path().join("checkpoints");

    let mut config = base_config(6);
    config.runtime.save_interval = Some(2);
    config.runtime.checkpoint.save_dir = Some(checkpoint_dir.clone());
    config.runtime.checkpoint.max_keep = Some(2);

    let mut trainer =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("trainer");
    let mut data = token_stream(&config);
    trainer.train(&mut data, None).expect("training runs");

    let kept: Vec<String> = fs::read_dir(&checkpoint_dir)
        .expect("read dir")
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .collect();
    let mut kept_sorted = kept.clone();
    kept_sorted.sort();
    assert_eq!(kept_sorted, vec!["iter_0000004", "iter_0000006"]);
}

#[test]
fn soft_prompt_run_trains_only_the_prompt() {
    let mut config = base_config(2);
    config.soft_prompt_tuning.enabled = true;
    config.soft_prompt_tuning.n_tokens = 3;

    let mut trainer =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("trainer");
    let frozen_before: Vec<Vec<f32>> = trainer
        .model()
        .named_parameters()
        .iter()
        .filter(|p| !p.trainable)
        .map(|p| {
            p.var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .collect();

    let mut data = token_stream(&config);
    trainer.train(&mut data, None).expect("training runs");

    let frozen_after: Vec<Vec<f32>> = trainer
        .model()
        .named_parameters()
        .iter()
        .filter(|p| !p.trainable)
        .map(|p| {
            p.var
                .as_tensor()
                .flatten_all()
                .unwrap()
                .to_vec1::<f32>()
                .unwrap()
        })
        .collect();
    assert_eq!(frozen_before, frozen_after, "frozen parameters never move");
}

#[test]
fn validation_runs_during_training() {
    let mut config = base_config(4);
    config.runtime.eval_interval = Some(2);
    config.runtime.eval_iters = 2;

    let mut trainer =
        Trainer::new(config.clone(), Device::Cpu, Collaborators::default()).expect("trainer");
    let mut train_data = token_stream(&config);
    let mut valid_data = token_stream(&config);
    let outcome = trainer
        .train(
            &mut train_data,
            Some(&mut valid_data as &mut dyn pretrain::DataIterator),
        )
        .expect("training with eval runs");
    assert_eq!(outcome, TrainOutcome::Completed { iteration: 4 });
}
