use burn::{
    prelude::*,
    tensor::{activation::relu, backend::AutodiffBackend},
};

use crate::model::network::Critic;

/// `ln(1 + e^x)` written so neither branch overflows.
pub fn softplus<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    relu(x.clone()) + x.abs().neg().exp().log1p()
}

/// Weight and probe step of the R1 penalty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct R1Penalty {
    pub gamma: f64,
    /// Length of the finite-difference step taken along each sample's input gradient.
    pub probe_step: f64,
}

#[derive(Debug, Clone)]
pub struct DiscriminatorLoss<B: Backend> {
    /// Logistic term plus penalty; the only tensor that should be backpropagated.
    pub total: Tensor<B, 1>,
    pub logistic: f32,
    pub r1_penalty: f32,
}

/// `mean(softplus(d_fake) + softplus(-d_real))`, before any penalty.
pub fn d_logistic<B: Backend>(d_fake: Tensor<B, 1>, d_real: Tensor<B, 1>) -> Tensor<B, 1> {
    (softplus(d_fake) + softplus(d_real.neg())).mean()
}

/// Discriminator loss with the simple R1 gradient penalty around `reals`.
///
/// `d_real` must come from `critic` applied to `reals`.
pub fn d_logistic_simplegp<B, C>(
    critic: &C,
    reals: Tensor<B, 4>,
    d_real: Tensor<B, 1>,
    d_fake: Tensor<B, 1>,
    lod: usize,
    blend_factor: f64,
    r1: R1Penalty,
) -> DiscriminatorLoss<B>
where
    B: AutodiffBackend,
    C: Critic<B>,
{
    let logistic = d_logistic(d_fake, d_real);
    let logistic_value = logistic.clone().into_scalar().elem::<f32>();

    if r1.gamma == 0.0 {
        return DiscriminatorLoss {
            total: logistic,
            logistic: logistic_value,
            r1_penalty: 0.0,
        };
    }

    let penalty = r1_penalty(critic, reals, lod, blend_factor, r1);
    let r1_value = penalty.clone().into_scalar().elem::<f32>();
    DiscriminatorLoss {
        total: logistic + penalty,
        logistic: logistic_value,
        r1_penalty: r1_value,
    }
}

/// `gamma / 2 * mean_i |d sum(D(x)) / d x_i|^2`, differentiable in the critic's parameters.
///
/// The value is computed from the exact input gradient. Its parameter gradient comes from a
/// central difference of the critic along that input gradient, which matches the exact
/// second-order term up to `O(probe_step^2)`.
pub fn r1_penalty<B, C>(
    critic: &C,
    reals: Tensor<B, 4>,
    lod: usize,
    blend_factor: f64,
    r1: R1Penalty,
) -> Tensor<B, 1>
where
    B: AutodiffBackend,
    C: Critic<B>,
{
    let reals = reals.detach();
    let [batch, channels, height, width] = reals.dims();
    let device = reals.device();

    let probe = reals.clone().require_grad();
    let grads = critic
        .critique(probe.clone(), lod, blend_factor)
        .sum()
        .backward();
    let Some(slope) = probe.grad(&grads) else {
        // The critic ignores its input: nothing to penalise.
        return Tensor::zeros([1], &device);
    };
    let slope = Tensor::<B, 4>::from_inner(slope);

    let squared_norm = slope
        .clone()
        .powf_scalar(2.0)
        .reshape([batch, channels * height * width])
        .sum_dim(1)
        .reshape([batch]);
    let value = squared_norm.clone().mean() * (r1.gamma * 0.5);

    let step = squared_norm
        .sqrt()
        .clamp_min(1e-12)
        .recip()
        .mul_scalar(r1.probe_step);
    let offset = slope * step.clone().reshape([batch, 1, 1, 1]);
    let ahead = critic.critique(reals.clone() + offset.clone(), lod, blend_factor);
    let behind = critic.critique(reals - offset, lod, blend_factor);
    let directional = (ahead - behind) / step.mul_scalar(2.0);
    let surrogate = directional.mean() * r1.gamma;

    value + surrogate.clone() - surrogate.detach()
}

/// Non-saturating generator loss `mean(softplus(-d_fake))`.
pub fn g_logistic_nonsaturating<B: Backend>(d_fake: Tensor<B, 1>) -> Tensor<B, 1> {
    softplus(d_fake.neg()).mean()
}
