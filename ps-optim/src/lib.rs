//! Optimizer kernels: pure functions `Update(grad, lr, value) -> ok` (§4.2).
//!
//! Each kernel validates `grad`'s shape/type against the value's parameter
//! tensor, lazily allocates any auxiliary state tensors it needs (shaped
//! like the parameter), and reads its hyperparameters once at construction
//! time from the model's [`OptimizerSpec`] — never per call, so a kernel
//! behaves identically across every push that reaches it.

use ps_data::{DeviceContext, OptimizerSpec, StateTag, Tensor, Value};
use ps_errors::{PsError, PsResult};

/// A constructed optimizer kernel, tagged by which of the four supported
/// algorithms it is. Keeping this as one enum (rather than four trait
/// objects) matches §9's "optimizer tagged-variant design" note — there's
/// a small, closed set of kernels and no plugin mechanism is required.
#[derive(Debug, Clone, PartialEq)]
pub enum Optimizer {
    /// `v <- v - lr * grad`. No state.
    Sgd,
    /// Maintains `state_sum`.
    Adagrad { eps: f64, weight_decay: f64 },
    /// Maintains `square_avg` and, if `centred`, `grad_avg`.
    Rmsprop {
        alpha: f64,
        eps: f64,
        centred: bool,
        weight_decay: f64,
    },
    /// Maintains `first_moment`, `second_moment`, and, if `amsgrad`,
    /// `second_moment_max`.
    Adam {
        beta1: f64,
        beta2: f64,
        eps: f64,
        amsgrad: bool,
        weight_decay: f64,
    },
}

impl Optimizer {
    /// Construct a kernel from a model's optimizer spec, reading every
    /// hyperparameter once (§4.2 point 3).
    pub fn from_spec(spec: &OptimizerSpec) -> PsResult<Self> {
        let weight_decay = spec.config_or("weight_decay", 0.0);
        match spec.kind.as_str() {
            "sgd" => Ok(Optimizer::Sgd),
            "adagrad" => Ok(Optimizer::Adagrad {
                eps: spec.config_or("eps", 1e-8),
                weight_decay,
            }),
            "rmsprop" => Ok(Optimizer::Rmsprop {
                alpha: spec.config_or("alpha", 0.99),
                eps: spec.config_or("eps", 1e-8),
                centred: spec.flag_or("centred", false),
                weight_decay,
            }),
            "adam" => Ok(Optimizer::Adam {
                beta1: spec.config_or("beta1", 0.9),
                beta2: spec.config_or("beta2", 0.999),
                eps: spec.config_or("eps", 1e-8),
                amsgrad: spec.flag_or("amsgrad", false),
                weight_decay,
            }),
            other => Err(PsError::internal(format!("unknown optimizer kind {other:?}"))),
        }
    }

    /// Apply this kernel to `value` in place, given `grad` and a learning
    /// rate. Validates shape/type first (§4.2 point 1); all auxiliary
    /// state is lazily allocated (§4.2 point 2).
    pub fn update(&self, value: &mut Value, grad: &Tensor, lr: f64, device: &DeviceContext) -> PsResult<()> {
        validate_grad(value, grad)?;
        let effective_grad = self.apply_weight_decay(value, grad)?;
        match self {
            Optimizer::Sgd => sgd_update(value, &effective_grad, lr),
            Optimizer::Adagrad { eps, .. } => adagrad_update(value, &effective_grad, lr, *eps, device),
            Optimizer::Rmsprop {
                alpha, eps, centred, ..
            } => rmsprop_update(value, &effective_grad, lr, *alpha, *eps, *centred, device),
            Optimizer::Adam {
                beta1,
                beta2,
                eps,
                amsgrad,
                ..
            } => adam_update(value, &effective_grad, lr, *beta1, *beta2, *eps, *amsgrad, device),
        }
    }

    fn apply_weight_decay(&self, value: &Value, grad: &Tensor) -> PsResult<Tensor> {
        let weight_decay = match self {
            Optimizer::Sgd => 0.0,
            Optimizer::Adagrad { weight_decay, .. }
            | Optimizer::Rmsprop { weight_decay, .. }
            | Optimizer::Adam { weight_decay, .. } => *weight_decay,
        };
        if weight_decay == 0.0 {
            return Ok(grad.clone_deep());
        }
        let mut effective = grad.clone_deep();
        effective.add_scaled_in_place(value.tensor(), weight_decay)?;
        Ok(effective)
    }
}

fn validate_grad(value: &Value, grad: &Tensor) -> PsResult<()> {
    if grad.element_type() != value.element_type() {
        return Err(PsError::ElementTypeMismatch {
            expected: value.element_type().to_string(),
            actual: grad.element_type().to_string(),
        });
    }
    if grad.size() != value.tensor().size() {
        return Err(PsError::ShapeMismatch {
            expected: value.shape().dims().to_vec(),
            actual: grad.shape().dims().to_vec(),
        });
    }
    Ok(())
}

fn sgd_update(value: &mut Value, grad: &Tensor, lr: f64) -> PsResult<()> {
    value.tensor_mut().add_scaled_in_place(grad, -lr)
}

fn adagrad_update(value: &mut Value, grad: &Tensor, lr: f64, eps: f64, device: &DeviceContext) -> PsResult<()> {
    let mut grad_sq = grad.clone_deep();
    grad_sq.square_in_place()?;
    let state_sum = value.state_or_init(StateTag::StateSum, device);
    state_sum.add_scaled_in_place(&grad_sq, 1.0)?;

    let mut denom = state_sum.clone_deep();
    denom.sqrt_in_place()?;
    let mut delta = grad.clone_deep();
    delta.div_add_eps_in_place(&denom, eps)?;
    value.tensor_mut().add_scaled_in_place(&delta, -lr)
}

fn rmsprop_update(
    value: &mut Value,
    grad: &Tensor,
    lr: f64,
    alpha: f64,
    eps: f64,
    centred: bool,
    device: &DeviceContext,
) -> PsResult<()> {
    {
        let square_avg = value.state_or_init(StateTag::SquareAvg, device);
        square_avg.ema_of_square_in_place(grad, alpha)?;
    }

    let variance = if centred {
        let grad_avg = value.state_or_init(StateTag::GradAvg, device);
        grad_avg.ema_in_place(grad, alpha)?;
        let grad_avg = value.state(StateTag::GradAvg).unwrap().clone_deep();
        let mut grad_avg_sq = grad_avg;
        grad_avg_sq.square_in_place()?;
        let mut variance = value.state(StateTag::SquareAvg).unwrap().clone_deep();
        variance.add_scaled_in_place(&grad_avg_sq, -1.0)?;
        variance
    } else {
        value.state(StateTag::SquareAvg).unwrap().clone_deep()
    };

    let mut denom = variance;
    denom.sqrt_in_place()?;
    let mut delta = grad.clone_deep();
    delta.div_add_eps_in_place(&denom, eps)?;
    value.tensor_mut().add_scaled_in_place(&delta, -lr)
}

#[allow(clippy::too_many_arguments)]
fn adam_update(
    value: &mut Value,
    grad: &Tensor,
    lr: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    amsgrad: bool,
    device: &DeviceContext,
) -> PsResult<()> {
    {
        let m = value.state_or_init(StateTag::FirstMoment, device);
        m.ema_in_place(grad, beta1)?;
    }
    {
        let v_sq = value.state_or_init(StateTag::SecondMoment, device);
        v_sq.ema_of_square_in_place(grad, beta2)?;
    }

    let step = value.scalar(StateTag::Steps) + 1;
    value.set_scalar(StateTag::Steps, step);

    let v_for_denom = if amsgrad {
        let current = value.state(StateTag::SecondMoment).unwrap().clone_deep();
        let v_max = value.state_or_init(StateTag::SecondMomentMax, device);
        v_max.max_in_place(&current)?;
        value.state(StateTag::SecondMomentMax).unwrap().clone_deep()
    } else {
        value.state(StateTag::SecondMoment).unwrap().clone_deep()
    };

    let bias_correction1 = 1.0 - beta1.powi(step as i32);
    let bias_correction2 = 1.0 - beta2.powi(step as i32);

    let mut m_hat = value.state(StateTag::FirstMoment).unwrap().clone_deep();
    m_hat.mul_scalar_in_place(1.0 / bias_correction1)?;

    let mut v_hat = v_for_denom;
    v_hat.mul_scalar_in_place(1.0 / bias_correction2)?;
    v_hat.sqrt_in_place()?;

    m_hat.div_add_eps_in_place(&v_hat, eps)?;
    value.tensor_mut().add_scaled_in_place(&m_hat, -lr)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ps_data::{ElementType, Shape};

    fn dev() -> DeviceContext {
        DeviceContext::cpu()
    }

    fn value_of(values: &[f64]) -> Value {
        let t = Tensor::from_f64_slice(Shape::vector(values.len()), ElementType::F32, values).unwrap();
        Value::new(t)
    }

    #[test]
    fn sgd_matches_manual_computation() {
        let mut v = value_of(&[1.0, 1.0]);
        let grad = value_of(&[1.0, 1.0]).tensor().clone_deep();
        Optimizer::Sgd.update(&mut v, &grad, 0.1, &dev()).unwrap();
        for x in v.tensor().as_f64_vec().unwrap() {
            assert!((x - 0.9).abs() < 1e-6);
        }
    }

    #[test]
    fn adagrad_matches_spec_scenario_s2() {
        // grad [2,2] pushed twice, lr=1.0, eps=1e-8, starting from zero.
        let mut v = value_of(&[0.0, 0.0]);
        let grad = Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[2.0, 2.0]).unwrap();
        let opt = Optimizer::Adagrad {
            eps: 1e-8,
            weight_decay: 0.0,
        };
        opt.update(&mut v, &grad, 1.0, &dev()).unwrap();
        for x in v.tensor().as_f64_vec().unwrap() {
            assert!((x - (-1.0)).abs() < 1e-5, "got {x}");
        }
        opt.update(&mut v, &grad, 1.0, &dev()).unwrap();
        for x in v.tensor().as_f64_vec().unwrap() {
            assert!((x - (-1.707)).abs() < 1e-3, "got {x}");
        }
    }

    #[test]
    fn adam_step_counter_increments_per_update() {
        let mut v = value_of(&[0.0]);
        let grad = Tensor::from_f64_slice(Shape::vector(1), ElementType::F32, &[1.0]).unwrap();
        let opt = Optimizer::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            amsgrad: false,
            weight_decay: 0.0,
        };
        opt.update(&mut v, &grad, 0.01, &dev()).unwrap();
        assert_eq!(v.scalar(StateTag::Steps), 1);
        opt.update(&mut v, &grad, 0.01, &dev()).unwrap();
        assert_eq!(v.scalar(StateTag::Steps), 2);
    }

    #[test]
    fn optimizer_purity_repeated_updates_from_same_state_are_identical() {
        let opt = Optimizer::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            amsgrad: true,
            weight_decay: 0.0,
        };
        let grad = Tensor::from_f64_slice(Shape::vector(2), ElementType::F32, &[0.5, -0.3]).unwrap();
        let mut a = value_of(&[1.0, 2.0]);
        let mut b = value_of(&[1.0, 2.0]);
        opt.update(&mut a, &grad, 0.1, &dev()).unwrap();
        opt.update(&mut b, &grad, 0.1, &dev()).unwrap();
        assert_eq!(
            a.tensor().as_f64_vec().unwrap(),
            b.tensor().as_f64_vec().unwrap()
        );
    }

    #[test]
    fn adagrad_runs_on_an_f64_table() {
        let t = Tensor::from_f64_slice(Shape::vector(2), ElementType::F64, &[0.0, 0.0]).unwrap();
        let mut v = Value::new(t);
        let grad = Tensor::from_f64_slice(Shape::vector(2), ElementType::F64, &[2.0, 2.0]).unwrap();
        let opt = Optimizer::Adagrad {
            eps: 1e-8,
            weight_decay: 0.0,
        };
        opt.update(&mut v, &grad, 1.0, &dev()).unwrap();
        for x in v.tensor().as_f64_vec().unwrap() {
            assert!((x - (-1.0)).abs() < 1e-5, "got {x}");
        }
    }

    #[test]
    fn adam_runs_on_an_f64_table() {
        let t = Tensor::from_f64_slice(Shape::vector(1), ElementType::F64, &[0.0]).unwrap();
        let mut v = Value::new(t);
        let grad = Tensor::from_f64_slice(Shape::vector(1), ElementType::F64, &[1.0]).unwrap();
        let opt = Optimizer::Adam {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            amsgrad: true,
            weight_decay: 0.0,
        };
        opt.update(&mut v, &grad, 0.01, &dev()).unwrap();
        assert_eq!(v.scalar(StateTag::Steps), 1);
        assert!(v.tensor().as_f64_vec().unwrap()[0] < 0.0);
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let mut v = value_of(&[0.0, 0.0]);
        let grad = Tensor::from_f64_slice(Shape::vector(3), ElementType::F32, &[1.0; 3]).unwrap();
        assert!(Optimizer::Sgd.update(&mut v, &grad, 0.1, &dev()).is_err());
    }

    #[test]
    fn unknown_optimizer_kind_is_rejected() {
        let spec = OptimizerSpec {
            kind: "bogus".to_string(),
            config: Default::default(),
        };
        assert!(Optimizer::from_spec(&spec).is_err());
    }
}
