use std::collections::{BTreeMap, HashMap};

pub mod scaler;

pub use scaler::{GradientScaler, GradientScalerState, LossScaleConfig};

use candle_core::{backprop::GradStore, DType, Device, Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::{
    config::{OptimizerType, PretrainConfig},
    model::NamedParameter,
    PretrainError,
};

const EPS: f64 = 1e-12;

/// Parameters sharing one weight-decay setting.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub parameters: Vec<NamedParameter>,
    pub weight_decay: f64,
}

/// Splits trainable parameters into a decayed and an undecayed group.
/// Biases and one-dimensional tensors (norm gains and the like) never
/// receive weight decay.
pub fn build_param_groups(parameters: &[NamedParameter], weight_decay: f64) -> Vec<ParamGroup> {
    let mut decayed = Vec::new();
    let mut undecayed = Vec::new();
    for parameter in parameters {
        if !parameter.trainable {
            continue;
        }
        let is_undecayed =
            parameter.var.as_tensor().dims().len() < 2 || parameter.name.ends_with("bias");
        if is_undecayed {
            undecayed.push(parameter.clone());
        } else {
            decayed.push(parameter.clone());
        }
    }

    let mut groups = Vec::new();
    if !decayed.is_empty() {
        groups.push(ParamGroup {
            parameters: decayed,
            weight_decay,
        });
    }
    if !undecayed.is_empty() {
        groups.push(ParamGroup {
            parameters: undecayed,
            weight_decay: 0.0,
        });
    }
    groups
}

/// Update rule surface shared by all local optimizers.
pub trait Optimizer: Send {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), PretrainError>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    fn param_group_count(&self) -> usize;

    fn zero_grad(&self, grads: &mut GradStore);

    fn state(&self) -> Result<OptimizerState, PretrainError>;

    fn load_state(&mut self, state: OptimizerState) -> Result<(), PretrainError>;
}

/// What the run has for an optimizer. Optimizer-less runs and engines
/// that construct their own distributed optimizer both flow through
/// here, so every consumer has to say what it does in those cases.
pub enum OptimizerHandle {
    /// No optimizer at all (`no_load_optim` runs).
    Disabled,
    /// Construction is delegated to the distributed engine.
    Deferred,
    Local(Box<dyn Optimizer>),
}

impl OptimizerHandle {
    pub fn is_disabled(&self) -> bool {
        matches!(self, OptimizerHandle::Disabled)
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, OptimizerHandle::Deferred)
    }

    pub fn as_local(&self) -> Option<&dyn Optimizer> {
        match self {
            OptimizerHandle::Local(optimizer) => Some(optimizer.as_ref()),
            _ => None,
        }
    }

    pub fn as_local_mut(&mut self) -> Option<&mut (dyn Optimizer + '_)> {
        match self {
            OptimizerHandle::Local(optimizer) => Some(optimizer.as_mut()),
            _ => None,
        }
    }

    /// Learning rate as logged: zero when there is nothing to drive.
    pub fn learning_rate(&self) -> f64 {
        match self.as_local() {
            Some(optimizer) if optimizer.param_group_count() > 0 => optimizer.learning_rate(),
            _ => 0.0,
        }
    }
}

/// Builds the configured optimizer over the model's trainable
/// parameters. Returns `Disabled` when the run skips optimizer state
/// and `Deferred` for algorithms owned by the distributed engine.
pub fn build_optimizer(
    config: &PretrainConfig,
    parameters: &[NamedParameter],
) -> Result<OptimizerHandle, PretrainError> {
    if config.runtime.no_load_optim {
        return Ok(OptimizerHandle::Disabled);
    }

    let groups = build_param_groups(parameters, config.optimizer.weight_decay);
    let opt = &config.optimizer;
    let clip = config.runtime.max_grad_norm;
    let optimizer: Box<dyn Optimizer> = match opt.optimizer_type {
        OptimizerType::OneBitAdam => return Ok(OptimizerHandle::Deferred),
        OptimizerType::Adam => {
            Box::new(AdamOptimizer::new(groups, opt, None)?.with_clip_global_norm(clip))
        }
        OptimizerType::CpuAdam | OptimizerType::CpuTorchAdam => Box::new(
            AdamOptimizer::new(groups, opt, Some(Device::Cpu))?.with_clip_global_norm(clip),
        ),
        OptimizerType::Sm3 => {
            Box::new(Sm3Optimizer::new(groups, opt)?.with_clip_global_norm(clip))
        }
        OptimizerType::MadgradWd => {
            Box::new(MadgradOptimizer::new(groups, opt)?.with_clip_global_norm(clip))
        }
    };
    Ok(OptimizerHandle::Local(optimizer))
}

struct Slot {
    name: String,
    param: Var,
    dtype: DType,
    weight_decay: f64,
    master: Option<Var>,
    /// Per-algorithm state tensors keyed by a short tag.
    state: BTreeMap<&'static str, Tensor>,
}

fn build_slots(
    groups: Vec<ParamGroup>,
    state_device: Option<&Device>,
    use_master_weights: bool,
) -> Result<(Vec<Slot>, usize), PretrainError> {
    let group_count = groups.len();
    let mut slots = Vec::new();
    for group in groups {
        for parameter in group.parameters {
            let tensor = parameter.var.as_tensor();
            if !tensor.dtype().is_float() {
                return Err(PretrainError::initialization(format!(
                    "optimizer received non-floating parameter '{}'",
                    parameter.name
                )));
            }
            let dtype = tensor.dtype();
            let master = if use_master_weights && dtype != DType::F32 {
                let device = state_device.unwrap_or(tensor.device());
                let fp32 = tensor
                    .to_dtype(DType::F32)
                    .map_err(to_runtime_error)?
                    .to_device(device)
                    .map_err(to_runtime_error)?;
                Some(Var::from_tensor(&fp32).map_err(to_runtime_error)?)
            } else {
                None
            };
            slots.push(Slot {
                name: parameter.name,
                param: parameter.var,
                dtype,
                weight_decay: group.weight_decay,
                master,
                state: BTreeMap::new(),
            });
        }
    }
    Ok((slots, group_count))
}

struct ProcessedGradient {
    index: usize,
    grad: Tensor,
    norm: f64,
}

/// Pulls gradients for every slot out of the store, casts them to f32
/// on the state device, and applies global norm clipping.
fn collect_gradients(
    slots: &[Slot],
    grads: &mut GradStore,
    state_device: Option<&Device>,
    clip_global_norm: Option<f64>,
) -> Result<Vec<ProcessedGradient>, PretrainError> {
    let mut processed = Vec::new();
    for (index, slot) in slots.iter().enumerate() {
        let grad = match grads.remove(slot.param.as_tensor()) {
            Some(grad) => grad,
            None => continue,
        };
        let mut grad = grad.to_dtype(DType::F32).map_err(to_runtime_error)?;
        if let Some(device) = state_device {
            grad = grad.to_device(device).map_err(to_runtime_error)?;
        }
        let norm = tensor_l2_norm(&grad)?;
        processed.push(ProcessedGradient { index, grad, norm });
    }

    if let Some(max_norm) = clip_global_norm {
        let total_norm_sq: f64 = processed.iter().map(|g| g.norm * g.norm).sum();
        let total_norm = total_norm_sq.sqrt();
        if total_norm > max_norm {
            let scale = max_norm / (total_norm + EPS);
            for item in &mut processed {
                item.grad = item.grad.affine(scale, 0.0).map_err(to_runtime_error)?;
                item.norm *= scale;
            }
        }
    }

    Ok(processed)
}

fn slot_base_tensor(slot: &Slot) -> Result<Tensor, PretrainError> {
    match &slot.master {
        Some(master) => Ok(master.as_tensor().clone()),
        None => slot
            .param
            .as_tensor()
            .to_dtype(DType::F32)
            .map_err(to_runtime_error),
    }
}

fn write_back(slot: &Slot, next: Tensor) -> Result<(), PretrainError> {
    if let Some(master) = &slot.master {
        master.set(&next).map_err(to_runtime_error)?;
    }
    let mut cast = next;
    if cast.device().location() != slot.param.as_tensor().device().location() {
        cast = cast
            .to_device(slot.param.as_tensor().device())
            .map_err(to_runtime_error)?;
    }
    if slot.dtype != DType::F32 {
        cast = cast.to_dtype(slot.dtype).map_err(to_runtime_error)?;
    }
    slot.param.set(&cast).map_err(to_runtime_error)
}

/// Adam with bias correction and decoupled weight decay. With a state
/// device set, moments and master weights live there and updates are
/// computed off the accelerator.
pub struct AdamOptimizer {
    slots: Vec<Slot>,
    group_count: usize,
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    state_device: Option<Device>,
    step: usize,
    clip_global_norm: Option<f64>,
}

impl AdamOptimizer {
    pub fn new(
        groups: Vec<ParamGroup>,
        config: &crate::config::OptimizerConfig,
        state_device: Option<Device>,
    ) -> Result<Self, PretrainError> {
        let (mut slots, group_count) = build_slots(groups, state_device.as_ref(), true)?;
        for slot in &mut slots {
            let device = state_device
                .clone()
                .unwrap_or_else(|| slot.param.as_tensor().device().clone());
            let dims = slot.param.as_tensor().dims().to_vec();
            slot.state.insert(
                "first_moment",
                Tensor::zeros(dims.as_slice(), DType::F32, &device).map_err(to_runtime_error)?,
            );
            slot.state.insert(
                "second_moment",
                Tensor::zeros(dims.as_slice(), DType::F32, &device).map_err(to_runtime_error)?,
            );
        }
        Ok(Self {
            slots,
            group_count,
            learning_rate: config.learning_rate,
            beta1: config.beta1,
            beta2: config.beta2,
            epsilon: config.epsilon,
            state_device,
            step: 0,
            clip_global_norm: None,
        })
    }

    pub fn with_clip_global_norm(mut self, max_norm: Option<f64>) -> Self {
        self.clip_global_norm = max_norm;
        self
    }
}

impl Optimizer for AdamOptimizer {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), PretrainError> {
        let processed = collect_gradients(
            &self.slots,
            grads,
            self.state_device.as_ref(),
            self.clip_global_norm,
        )?;
        if processed.is_empty() {
            return Ok(());
        }

        self.step += 1;
        let bias_correction1 = 1.0 - self.beta1.powi(self.step as i32);
        let bias_correction2 = 1.0 - self.beta2.powi(self.step as i32);
        let scale_m = 1.0 / bias_correction1.max(EPS);
        let scale_v = 1.0 / bias_correction2.max(EPS);

        for item in processed {
            let slot = &mut self.slots[item.index];
            let prev_m = &slot.state["first_moment"];
            let prev_v = &slot.state["second_moment"];

            let new_m = prev_m
                .affine(self.beta1, 0.0)
                .map_err(to_runtime_error)?
                .add(&item.grad.affine(1.0 - self.beta1, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;
            let new_v = prev_v
                .affine(self.beta2, 0.0)
                .map_err(to_runtime_error)?
                .add(&grad_sq.affine(1.0 - self.beta2, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;

            let m_hat = new_m.affine(scale_m, 0.0).map_err(to_runtime_error)?;
            let v_hat = new_v.affine(scale_v, 0.0).map_err(to_runtime_error)?;
            let denom = v_hat
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let update = m_hat
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot_base_tensor(slot)?;
            let decayed = if slot.weight_decay != 0.0 {
                base.affine(1.0 - self.learning_rate * slot.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed.sub(&update).map_err(to_runtime_error)?;
            write_back(slot, next)?;

            slot.state.insert("first_moment", new_m);
            slot.state.insert("second_moment", new_v);
        }

        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn param_group_count(&self) -> usize {
        self.group_count
    }

    fn zero_grad(&self, grads: &mut GradStore) {
        zero_slot_grads(&self.slots, grads);
    }

    fn state(&self) -> Result<OptimizerState, PretrainError> {
        snapshot_slots("adam", self.step, &self.slots)
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), PretrainError> {
        self.step = restore_slots("adam", state, &mut self.slots)?;
        Ok(())
    }
}

/// SM3 keeps a min-cover accumulator instead of per-element second
/// moments: rows and columns for matrices, per-element for vectors.
pub struct Sm3Optimizer {
    slots: Vec<Slot>,
    group_count: usize,
    learning_rate: f64,
    epsilon: f64,
    step: usize,
    clip_global_norm: Option<f64>,
}

impl Sm3Optimizer {
    pub fn new(
        groups: Vec<ParamGroup>,
        config: &crate::config::OptimizerConfig,
    ) -> Result<Self, PretrainError> {
        let (mut slots, group_count) = build_slots(groups, None, false)?;
        for slot in &mut slots {
            let tensor = slot.param.as_tensor();
            let device = tensor.device();
            match tensor.dims() {
                &[rows, cols] => {
                    slot.state.insert(
                        "row_accumulator",
                        Tensor::zeros((rows, 1), DType::F32, device).map_err(to_runtime_error)?,
                    );
                    slot.state.insert(
                        "col_accumulator",
                        Tensor::zeros((1, cols), DType::F32, device).map_err(to_runtime_error)?,
                    );
                }
                _ => {
                    slot.state.insert(
                        "accumulator",
                        Tensor::zeros(tensor.dims(), DType::F32, device)
                            .map_err(to_runtime_error)?,
                    );
                }
            }
        }
        Ok(Self {
            slots,
            group_count,
            learning_rate: config.learning_rate,
            epsilon: config.epsilon,
            step: 0,
            clip_global_norm: None,
        })
    }

    pub fn with_clip_global_norm(mut self, max_norm: Option<f64>) -> Self {
        self.clip_global_norm = max_norm;
        self
    }
}

impl Optimizer for Sm3Optimizer {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), PretrainError> {
        let processed = collect_gradients(&self.slots, grads, None, self.clip_global_norm)?;
        if processed.is_empty() {
            return Ok(());
        }
        self.step += 1;

        for item in processed {
            let slot = &mut self.slots[item.index];
            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;

            let estimate = if slot.state.contains_key("row_accumulator") {
                let rows = &slot.state["row_accumulator"];
                let cols = &slot.state["col_accumulator"];
                let cover = rows.broadcast_minimum(cols).map_err(to_runtime_error)?;
                let estimate = cover.add(&grad_sq).map_err(to_runtime_error)?;
                slot.state.insert(
                    "row_accumulator",
                    estimate.max_keepdim(1).map_err(to_runtime_error)?,
                );
                slot.state.insert(
                    "col_accumulator",
                    estimate.max_keepdim(0).map_err(to_runtime_error)?,
                );
                estimate
            } else {
                let estimate = slot.state["accumulator"]
                    .add(&grad_sq)
                    .map_err(to_runtime_error)?;
                slot.state.insert("accumulator", estimate.clone());
                estimate
            };

            let denom = estimate
                .sqrt()
                .map_err(to_runtime_error)?
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let update = item
                .grad
                .div(&denom)
                .map_err(to_runtime_error)?
                .affine(self.learning_rate, 0.0)
                .map_err(to_runtime_error)?;

            let base = slot_base_tensor(slot)?;
            let next = base.sub(&update).map_err(to_runtime_error)?;
            write_back(slot, next)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn param_group_count(&self) -> usize {
        self.group_count
    }

    fn zero_grad(&self, grads: &mut GradStore) {
        zero_slot_grads(&self.slots, grads);
    }

    fn state(&self) -> Result<OptimizerState, PretrainError> {
        snapshot_slots("sm3", self.step, &self.slots)
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), PretrainError> {
        self.step = restore_slots("sm3", state, &mut self.slots)?;
        Ok(())
    }
}

/// MADGRAD with decoupled weight decay. Dual-averaging state: gradient
/// sums, squared-gradient sums, and the initial parameter values.
pub struct MadgradOptimizer {
    slots: Vec<Slot>,
    group_count: usize,
    learning_rate: f64,
    momentum: f64,
    epsilon: f64,
    step: usize,
    clip_global_norm: Option<f64>,
}

impl MadgradOptimizer {
    pub fn new(
        groups: Vec<ParamGroup>,
        config: &crate::config::OptimizerConfig,
    ) -> Result<Self, PretrainError> {
        let (mut slots, group_count) = build_slots(groups, None, false)?;
        for slot in &mut slots {
            let tensor = slot.param.as_tensor();
            let device = tensor.device();
            let dims = tensor.dims();
            slot.state.insert(
                "grad_sum",
                Tensor::zeros(dims, DType::F32, device).map_err(to_runtime_error)?,
            );
            slot.state.insert(
                "grad_sum_sq",
                Tensor::zeros(dims, DType::F32, device).map_err(to_runtime_error)?,
            );
            let initial = tensor.to_dtype(DType::F32).map_err(to_runtime_error)?;
            slot.state.insert("initial_point", initial);
        }
        Ok(Self {
            slots,
            group_count,
            learning_rate: config.learning_rate,
            momentum: config.momentum,
            epsilon: config.epsilon,
            step: 0,
            clip_global_norm: None,
        })
    }

    pub fn with_clip_global_norm(mut self, max_norm: Option<f64>) -> Self {
        self.clip_global_norm = max_norm;
        self
    }
}

impl Optimizer for MadgradOptimizer {
    fn step(&mut self, grads: &mut GradStore) -> Result<(), PretrainError> {
        let processed = collect_gradients(&self.slots, grads, None, self.clip_global_norm)?;
        if processed.is_empty() {
            return Ok(());
        }

        let lamb = self.learning_rate * ((self.step + 1) as f64).sqrt();
        self.step += 1;

        for item in processed {
            let slot = &mut self.slots[item.index];
            let grad_sq = item.grad.sqr().map_err(to_runtime_error)?;

            let grad_sum = slot.state["grad_sum"]
                .add(&item.grad.affine(lamb, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            let grad_sum_sq = slot.state["grad_sum_sq"]
                .add(&grad_sq.affine(lamb, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;

            let denom = grad_sum_sq
                .powf(1.0 / 3.0)
                .map_err(to_runtime_error)?
                .affine(1.0, self.epsilon)
                .map_err(to_runtime_error)?;
            let z = slot.state["initial_point"]
                .sub(&grad_sum.div(&denom).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;

            let base = slot_base_tensor(slot)?;
            let decayed = if slot.weight_decay != 0.0 {
                base.affine(1.0 - self.learning_rate * slot.weight_decay, 0.0)
                    .map_err(to_runtime_error)?
            } else {
                base
            };
            let next = decayed
                .affine(self.momentum, 0.0)
                .map_err(to_runtime_error)?
                .add(&z.affine(1.0 - self.momentum, 0.0).map_err(to_runtime_error)?)
                .map_err(to_runtime_error)?;
            write_back(slot, next)?;

            slot.state.insert("grad_sum", grad_sum);
            slot.state.insert("grad_sum_sq", grad_sum_sq);
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }

    fn param_group_count(&self) -> usize {
        self.group_count
    }

    fn zero_grad(&self, grads: &mut GradStore) {
        zero_slot_grads(&self.slots, grads);
    }

    fn state(&self) -> Result<OptimizerState, PretrainError> {
        snapshot_slots("madgrad_wd", self.step, &self.slots)
    }

    fn load_state(&mut self, state: OptimizerState) -> Result<(), PretrainError> {
        self.step = restore_slots("madgrad_wd", state, &mut self.slots)?;
        Ok(())
    }
}

fn zero_slot_grads(slots: &[Slot], grads: &mut GradStore) {
    for slot in slots {
        let _ = grads.remove(slot.param.as_tensor());
    }
}

/// Serializable optimizer snapshot: the step counter plus every state
/// tensor of every slot, flattened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerState {
    pub algorithm: String,
    pub step: usize,
    pub parameters: Vec<ParameterState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterState {
    pub name: String,
    pub shape: Vec<usize>,
    pub slots: BTreeMap<String, StateTensor>,
    pub master: Option<Vec<f32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

fn snapshot_slots(
    algorithm: &str,
    step: usize,
    slots: &[Slot],
) -> Result<OptimizerState, PretrainError> {
    let mut parameters = Vec::with_capacity(slots.len());
    for slot in slots {
        let mut state_tensors = BTreeMap::new();
        for (tag, tensor) in &slot.state {
            state_tensors.insert(
                tag.to_string(),
                StateTensor {
                    shape: tensor.dims().to_vec(),
                    values: flatten_to_vec(tensor)?,
                },
            );
        }
        let master = match &slot.master {
            Some(master) => Some(flatten_to_vec(master.as_tensor())?),
            None => None,
        };
        parameters.push(ParameterState {
            name: slot.name.clone(),
            shape: slot.param.as_tensor().dims().to_vec(),
            slots: state_tensors,
            master,
        });
    }
    Ok(OptimizerState {
        algorithm: algorithm.to_string(),
        step,
        parameters,
    })
}

fn restore_slots(
    algorithm: &str,
    state: OptimizerState,
    slots: &mut [Slot],
) -> Result<usize, PretrainError> {
    if state.algorithm != algorithm {
        return Err(PretrainError::runtime(format!(
            "optimizer state was written by '{}' but this run uses '{}'",
            state.algorithm, algorithm
        )));
    }

    let mut by_name: HashMap<_, _> = state
        .parameters
        .into_iter()
        .map(|param| (param.name.clone(), param))
        .collect();

    for slot in slots.iter_mut() {
        let restored = by_name.remove(&slot.name).ok_or_else(|| {
            PretrainError::runtime(format!("optimizer state missing parameter '{}'", slot.name))
        })?;
        if slot.param.as_tensor().dims() != restored.shape.as_slice() {
            return Err(PretrainError::runtime(format!(
                "optimizer state shape mismatch for '{}'",
                slot.name
            )));
        }

        let tags: Vec<&'static str> = slot.state.keys().copied().collect();
        for tag in tags {
            let stored = restored.slots.get(tag).ok_or_else(|| {
                PretrainError::runtime(format!(
                    "optimizer state for '{}' missing '{}'",
                    slot.name, tag
                ))
            })?;
            let device = slot.param.as_tensor().device().clone();
            let tensor =
                Tensor::from_vec(stored.values.clone(), stored.shape.as_slice(), &device)
                    .map_err(to_runtime_error)?;
            if tensor.dims() != slot.state[tag].dims() {
                return Err(PretrainError::runtime(format!(
                    "optimizer state tensor shape mismatch for '{}/{}'",
                    slot.name, tag
                )));
            }
            slot.state.insert(tag, tensor);
        }

        match (&slot.master, restored.master) {
            (Some(master), Some(values)) => {
                let dims = master.as_tensor().dims().to_vec();
                let device = master.as_tensor().device().clone();
                let tensor = Tensor::from_vec(values, (dims.iter().product::<usize>(),), &device)
                    .map_err(to_runtime_error)?
                    .reshape(dims.as_slice())
                    .map_err(to_runtime_error)?;
                master.set(&tensor).map_err(to_runtime_error)?;
                let cast = tensor.to_dtype(slot.dtype).map_err(to_runtime_error)?;
                slot.param.set(&cast).map_err(to_runtime_error)?;
            }
            (None, None) => {}
            _ => {
                return Err(PretrainError::runtime(format!(
                    "master-weight mismatch in optimizer state for '{}'",
                    slot.name
                )));
            }
        }
    }

    if !by_name.is_empty() {
        return Err(PretrainError::runtime(
            "optimizer state has extra parameters not present in the model",
        ));
    }
    Ok(state.step)
}

pub(crate) fn tensor_l2_norm(tensor: &Tensor) -> Result<f64, PretrainError> {
    let squared = tensor
        .sqr()
        .map_err(to_runtime_error)?
        .sum_all()
        .map_err(to_runtime_error)?;
    let value = squared.to_vec0::<f32>().map_err(to_runtime_error)?;
    Ok((value as f64).sqrt())
}

fn flatten_to_vec(tensor: &Tensor) -> Result<Vec<f32>, PretrainError> {
    tensor
        .flatten_all()
        .map_err(to_runtime_error)?
        .to_vec1::<f32>()
        .map_err(to_runtime_error)
}

fn to_runtime_error(err: candle_core::Error) -> PretrainError {
    PretrainError::runtime(err.to_string())
}
