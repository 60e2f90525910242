use crate::{
    config::PretrainConfig,
    data::{CharCounter, DataIterator, Detokenizer},
    logging::Logger,
    loss::{LossDict, LM_LOSS_KEY},
    model::Model,
    parallel::ParallelGroup,
    step::StepEngine,
    PretrainError,
};

pub const LM_PPL_KEY: &str = "lm_loss_ppl";
pub const LM_CHAR_PPL_KEY: &str = "lm_loss_char_lvl_ppl";

/// Downstream task harness plugged in through config `eval_tasks`.
pub trait EvalHarness {
    fn run(
        &mut self,
        model: &mut dyn Model,
        config: &PretrainConfig,
        tasks: &[String],
    ) -> Result<LossDict, PretrainError>;
}

/// Forward-only pass over `eval_iters` evaluation iterations. The
/// model runs in evaluation mode for the pass and is left in
/// training-enabled mode afterward, whatever mode it started in.
pub fn evaluate(
    model: &mut dyn Model,
    engine: &mut StepEngine,
    data: Option<&mut (dyn DataIterator + '_)>,
    group: &dyn ParallelGroup,
    config: &PretrainConfig,
    detokenizer: Option<&dyn Detokenizer>,
) -> Result<LossDict, PretrainError> {
    model.set_training(false);
    let result = evaluate_inner(model, engine, data, group, config, detokenizer);
    model.set_training(true);
    result
}

fn evaluate_inner(
    model: &mut dyn Model,
    engine: &mut StepEngine,
    data: Option<&mut (dyn DataIterator + '_)>,
    group: &dyn ParallelGroup,
    config: &PretrainConfig,
    detokenizer: Option<&dyn Detokenizer>,
) -> Result<LossDict, PretrainError> {
    let mut totals = LossDict::new();
    let eval_iters = config.runtime.eval_iters.max(1);

    // Character counting wraps the iterator for the duration of the
    // pass; the wrapper is dropped before tokens_per_char is consumed.
    let tokens_per_char = match (config.runtime.char_level_ppl, detokenizer, data) {
        (true, Some(detokenizer), Some(data)) => {
            let mut counter = CharCounter::new(data, detokenizer);
            run_eval_iters(model, engine, Some(&mut counter), group, config, eval_iters, &mut totals)?;
            Some(counter.tokens_per_char()?)
        }
        (true, None, _) => {
            return Err(PretrainError::initialization(
                "char_level_ppl needs a detokenizer to count characters",
            ));
        }
        (_, _, data) => {
            run_eval_iters(model, engine, data, group, config, eval_iters, &mut totals)?;
            None
        }
    };

    let mut results = LossDict::new();
    for (key, total) in totals {
        results.insert(key, total / eval_iters as f64);
    }

    if let Some(lm_loss) = results.get(LM_LOSS_KEY).copied() {
        results.insert(LM_PPL_KEY.to_string(), lm_loss.exp());
        if let Some(tokens_per_char) = tokens_per_char {
            results.insert(
                LM_CHAR_PPL_KEY.to_string(),
                (lm_loss * tokens_per_char).exp(),
            );
        }
    }

    Ok(results)
}

fn run_eval_iters(
    model: &dyn Model,
    engine: &mut StepEngine,
    mut data: Option<&mut (dyn DataIterator + '_)>,
    group: &dyn ParallelGroup,
    config: &PretrainConfig,
    eval_iters: usize,
    totals: &mut LossDict,
) -> Result<(), PretrainError> {
    for _ in 0..eval_iters {
        let losses = engine.eval_step(model, data.as_deref_mut(), group, config)?;
        for (key, value) in losses {
            *totals.entry(key).or_insert(0.0) += value;
        }
    }
    Ok(())
}

/// Runs the evaluation pass plus any configured harness tasks and
/// writes one results block to the logger.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_and_print_results(
    prefix: &str,
    iteration: usize,
    model: &mut dyn Model,
    engine: &mut StepEngine,
    data: Option<&mut (dyn DataIterator + '_)>,
    group: &dyn ParallelGroup,
    config: &PretrainConfig,
    detokenizer: Option<&dyn Detokenizer>,
    harness: Option<&mut (dyn EvalHarness + '_)>,
    logger: &mut Logger,
) -> Result<LossDict, PretrainError> {
    let mut results = evaluate(model, engine, data, group, config, detokenizer)?;

    if let Some(harness) = harness {
        if !config.runtime.eval_tasks.is_empty() {
            let task_results = harness.run(model, config, &config.runtime.eval_tasks)?;
            results.extend(task_results);
        }
    }

    logger.log_evaluation(iteration, prefix, &results);
    Ok(results)
}
