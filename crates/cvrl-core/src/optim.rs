//! Optimizers and learning-rate schedules for Candle `Var` tensors.
//!
//! - [`Adam`]: Adam with L2 weight decay folded into the gradient and
//!   optional global gradient-norm clipping
//! - [`Sgd`]: SGD with heavy-ball momentum and L2 weight decay
//! - [`LrSchedule`]: constant, step decay or cosine, evaluated per epoch
//!
//! Optimizer state tensors are detached after every update so the autodiff
//! graph never grows across steps.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use serde::{Deserialize, Serialize};

use crate::error::{CvrlError, CvrlResult};

fn map_candle(e: candle_core::Error) -> CvrlError {
    CvrlError::tensor("Optimizer", e)
}

/// Per-epoch learning-rate schedule.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrSchedule {
    /// Base rate for every epoch.
    #[default]
    Constant,
    /// Multiply by `gamma` every `step_size` epochs.
    Step { step_size: usize, gamma: f64 },
    /// Half-cosine from the base rate to `min_lr` over `total_epochs`.
    Cosine { total_epochs: usize, min_lr: f64 },
}

impl LrSchedule {
    /// Learning rate after `epoch` completed epochs.
    pub fn lr_at(&self, base_lr: f64, epoch: usize) -> f64 {
        match *self {
            LrSchedule::Constant => base_lr,
            LrSchedule::Step { step_size, gamma } => {
                let decays = epoch / step_size.max(1);
                base_lr * gamma.powi(decays as i32)
            }
            LrSchedule::Cosine { total_epochs, min_lr } => {
                let progress = (epoch as f64 / total_epochs.max(1) as f64).min(1.0);
                let cosine_factor = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                min_lr + (base_lr - min_lr) * cosine_factor
            }
        }
    }

    pub fn validate(&self) -> CvrlResult<()> {
        match *self {
            LrSchedule::Constant => Ok(()),
            LrSchedule::Step { step_size, gamma } => {
                if step_size == 0 {
                    return Err(CvrlError::InvalidHyperparameter {
                        name: "step_size",
                        value: step_size.to_string(),
                        reason: "must be positive".to_string(),
                    });
                }
                if !(gamma > 0.0 && gamma <= 1.0) {
                    return Err(CvrlError::InvalidHyperparameter {
                        name: "gamma",
                        value: gamma.to_string(),
                        reason: "must lie in (0, 1]".to_string(),
                    });
                }
                Ok(())
            }
            LrSchedule::Cosine { total_epochs, min_lr } => {
                if total_epochs == 0 || min_lr < 0.0 {
                    return Err(CvrlError::InvalidHyperparameter {
                        name: "schedule",
                        value: format!("cosine(total_epochs={}, min_lr={})", total_epochs, min_lr),
                        reason: "total_epochs must be positive and min_lr non-negative".to_string(),
                    });
                }
                Ok(())
            }
        }
    }
}

/// Optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Adam,
    Sgd,
}

/// Optimizer hyperparameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    pub kind: OptimizerKind,
    pub learning_rate: f64,
    /// L2 penalty added to the gradient.
    pub weight_decay: f64,
    /// SGD momentum.
    pub momentum: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    /// Clip the global gradient norm to this value.
    pub max_grad_norm: Option<f64>,
    pub schedule: LrSchedule,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            kind: OptimizerKind::Adam,
            learning_rate: 1e-3,
            weight_decay: 1e-6,
            momentum: 0.9,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            max_grad_norm: None,
            schedule: LrSchedule::Constant,
        }
    }
}

impl OptimizerConfig {
    /// Linear-probe settings: Adam, lr 1e-3, wd 1e-6, halve every 10 epochs.
    pub fn linear_probe() -> Self {
        Self {
            schedule: LrSchedule::Step {
                step_size: 10,
                gamma: 0.5,
            },
            ..Default::default()
        }
    }

    /// Contrastive pre-training settings: SGD, lr 0.06, momentum 0.9, wd 5e-4, cosine.
    pub fn pretrain(epochs: usize) -> Self {
        Self {
            kind: OptimizerKind::Sgd,
            learning_rate: 0.06,
            weight_decay: 5e-4,
            momentum: 0.9,
            schedule: LrSchedule::Cosine {
                total_epochs: epochs.max(1),
                min_lr: 0.0,
            },
            ..Default::default()
        }
    }

    pub fn validate(&self) -> CvrlResult<()> {
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return Err(CvrlError::InvalidHyperparameter {
                name: "learning_rate",
                value: self.learning_rate.to_string(),
                reason: "must be a positive finite number".to_string(),
            });
        }
        if self.weight_decay < 0.0 {
            return Err(CvrlError::InvalidHyperparameter {
                name: "weight_decay",
                value: self.weight_decay.to_string(),
                reason: "must be non-negative".to_string(),
            });
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(CvrlError::InvalidHyperparameter {
                name: "momentum",
                value: self.momentum.to_string(),
                reason: "must lie in [0, 1)".to_string(),
            });
        }
        if let Some(max_norm) = self.max_grad_norm {
            if max_norm <= 0.0 {
                return Err(CvrlError::InvalidHyperparameter {
                    name: "max_grad_norm",
                    value: max_norm.to_string(),
                    reason: "must be positive".to_string(),
                });
            }
        }
        self.schedule.validate()
    }

    /// Build the configured optimizer over `vars`.
    pub fn build(&self, vars: Vec<Var>) -> CvrlResult<Box<dyn Optimizer>> {
        self.validate()?;
        match self.kind {
            OptimizerKind::Adam => Ok(Box::new(Adam::new(self.clone(), vars)?)),
            OptimizerKind::Sgd => Ok(Box::new(Sgd::new(self.clone(), vars)?)),
        }
    }
}

/// Gradient-descent update over a fixed set of vars.
pub trait Optimizer {
    /// Apply one update from precomputed gradients. Vars without a gradient are skipped.
    fn step(&mut self, grads: &GradStore) -> CvrlResult<()>;

    fn learning_rate(&self) -> f64;

    fn set_learning_rate(&mut self, lr: f64);

    /// Number of optimizer steps taken.
    fn global_step(&self) -> usize;

    /// Back-propagate `loss` and apply one update.
    fn backward_step(&mut self, loss: &Tensor) -> CvrlResult<()> {
        let grads = loss.backward().map_err(map_candle)?;
        self.step(&grads)
    }
}

/// Scale factor bringing the global gradient norm down to `max_norm`.
fn clip_scale(vars: &[&Var], grads: &GradStore, max_norm: Option<f64>, eps: f64) -> CvrlResult<f64> {
    let max_norm = match max_norm {
        Some(max_norm) => max_norm,
        None => return Ok(1.0),
    };
    let mut total_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let sq_sum: f32 = grad
                .sqr()
                .map_err(map_candle)?
                .sum_all()
                .map_err(map_candle)?
                .to_scalar()
                .map_err(map_candle)?;
            total_sq += sq_sum as f64;
        }
    }
    let total_norm = total_sq.sqrt();
    Ok(if total_norm > max_norm {
        max_norm / (total_norm + eps)
    } else {
        1.0
    })
}

/// `scale * grad + weight_decay * param`.
fn regularized_grad(grad: &Tensor, param: &Tensor, scale: f64, weight_decay: f64) -> CvrlResult<Tensor> {
    let grad = if (scale - 1.0).abs() > 1e-9 {
        grad.affine(scale, 0.0).map_err(map_candle)?
    } else {
        grad.clone()
    };
    if weight_decay > 0.0 {
        grad.add(&param.detach().affine(weight_decay, 0.0).map_err(map_candle)?)
            .map_err(map_candle)
    } else {
        Ok(grad)
    }
}

/// A tracked parameter with its moment estimates.
struct AdamParam {
    var: Var,
    m: Tensor,
    v: Tensor,
}

/// Adam with L2 weight decay.
pub struct Adam {
    config: OptimizerConfig,
    lr: f64,
    params: Vec<AdamParam>,
    step: usize,
}

impl Adam {
    pub fn new(config: OptimizerConfig, vars: Vec<Var>) -> CvrlResult<Self> {
        let params = vars
            .into_iter()
            .map(|var| {
                let m = var.as_tensor().zeros_like().map_err(map_candle)?;
                let v = var.as_tensor().zeros_like().map_err(map_candle)?;
                Ok(AdamParam { var, m, v })
            })
            .collect::<CvrlResult<Vec<_>>>()?;
        Ok(Self {
            lr: config.learning_rate,
            config,
            params,
            step: 0,
        })
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> CvrlResult<()> {
        self.step += 1;
        let t = self.step as i32;
        let (beta1, beta2, eps) = (self.config.beta1, self.config.beta2, self.config.epsilon);

        let vars: Vec<&Var> = self.params.iter().map(|p| &p.var).collect();
        let scale = clip_scale(&vars, grads, self.config.max_grad_norm, eps)?;

        let bc1 = 1.0 - beta1.powi(t);
        let bc2 = 1.0 - beta2.powi(t);
        let lr = self.lr;

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g,
                None => continue,
            };
            let grad = regularized_grad(grad, param.var.as_tensor(), scale, self.config.weight_decay)?;

            // m = β1 * m + (1 - β1) * grad
            param.m = param
                .m
                .affine(beta1, 0.0)
                .map_err(map_candle)?
                .add(&grad.affine(1.0 - beta1, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();
            // v = β2 * v + (1 - β2) * grad^2
            param.v = param
                .v
                .affine(beta2, 0.0)
                .map_err(map_candle)?
                .add(&grad.sqr().map_err(map_candle)?.affine(1.0 - beta2, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();

            let m_hat = param.m.affine(1.0 / bc1, 0.0).map_err(map_candle)?;
            let denom = param
                .v
                .affine(1.0 / bc2, 0.0)
                .map_err(map_candle)?
                .sqrt()
                .map_err(map_candle)?
                .affine(1.0, eps)
                .map_err(map_candle)?;
            let update = m_hat.div(&denom).map_err(map_candle)?.affine(-lr, 0.0).map_err(map_candle)?;

            let new_val = param
                .var
                .as_tensor()
                .add(&update)
                .map_err(map_candle)?
                .detach();
            param.var.set(&new_val).map_err(map_candle)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn global_step(&self) -> usize {
        self.step
    }
}

struct SgdParam {
    var: Var,
    velocity: Option<Tensor>,
}

/// SGD with momentum and L2 weight decay.
pub struct Sgd {
    config: OptimizerConfig,
    lr: f64,
    params: Vec<SgdParam>,
    step: usize,
}

impl Sgd {
    pub fn new(config: OptimizerConfig, vars: Vec<Var>) -> CvrlResult<Self> {
        Ok(Self {
            lr: config.learning_rate,
            config,
            params: vars
                .into_iter()
                .map(|var| SgdParam { var, velocity: None })
                .collect(),
            step: 0,
        })
    }

    pub fn num_params(&self) -> usize {
        self.params.len()
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &GradStore) -> CvrlResult<()> {
        self.step += 1;
        let vars: Vec<&Var> = self.params.iter().map(|p| &p.var).collect();
        let scale = clip_scale(&vars, grads, self.config.max_grad_norm, self.config.epsilon)?;
        let (lr, momentum) = (self.lr, self.config.momentum);

        for param in &mut self.params {
            let grad = match grads.get(param.var.as_tensor()) {
                Some(g) => g,
                None => continue,
            };
            let grad = regularized_grad(grad, param.var.as_tensor(), scale, self.config.weight_decay)?;

            // buf = momentum * buf + grad, first step buf = grad
            let direction = match (&param.velocity, momentum > 0.0) {
                (Some(buf), true) => buf
                    .affine(momentum, 0.0)
                    .map_err(map_candle)?
                    .add(&grad)
                    .map_err(map_candle)?
                    .detach(),
                _ => grad.detach(),
            };
            if momentum > 0.0 {
                param.velocity = Some(direction.clone());
            }

            let new_val = param
                .var
                .as_tensor()
                .sub(&direction.affine(lr, 0.0).map_err(map_candle)?)
                .map_err(map_candle)?
                .detach();
            param.var.set(&new_val).map_err(map_candle)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.lr = lr;
    }

    fn global_step(&self) -> usize {
        self.step
    }
}
