use burn::prelude::*;

/// Latent-to-style transform. Styles are laid out as `[batch, sites, w_dim]`,
/// one entry per modulation site of the generator.
pub trait StyleMapping<B: Backend> {
    fn map_styles(&self, latent: Tensor<B, 2>) -> Tensor<B, 3>;
}

/// Renders styles into images at the resolution of `lod`, fading the newest layer in
/// with `blend_factor`.
pub trait StyleGenerator<B: Backend> {
    fn synthesize(&self, styles: Tensor<B, 3>, lod: usize, blend_factor: f64) -> Tensor<B, 4>;

    fn layer_to_resolution(&self, lod: usize) -> usize;
}

/// Scores images with one logit each.
pub trait Critic<B: Backend> {
    fn critique(&self, images: Tensor<B, 4>, lod: usize, blend_factor: f64) -> Tensor<B, 1>;
}

/// The three parameter sets trained together.
#[derive(Debug, Clone)]
pub struct Networks<M, G, D> {
    pub mapping: M,
    pub generator: G,
    pub discriminator: D,
}

/// Splits every forward pass into `count` batch chunks.
///
/// All chunks run through the same parameters, so autodiff sums their gradients and the
/// result equals a single pass over the whole batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Replicas {
    count: usize,
}

impl Default for Replicas {
    fn default() -> Self {
        Self { count: 1 }
    }
}

impl Replicas {
    pub fn new(count: usize) -> Self {
        Self {
            count: count.max(1),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn wrap<'a, N>(&self, network: &'a N) -> Replicated<'a, N> {
        Replicated {
            network,
            replicas: *self,
        }
    }

    pub fn fan_out<B: Backend, const D: usize, const E: usize>(
        &self,
        input: Tensor<B, D>,
        forward: impl Fn(Tensor<B, D>) -> Tensor<B, E>,
    ) -> Tensor<B, E> {
        let batch = input.dims()[0];
        if self.count == 1 || batch < 2 {
            return forward(input);
        }
        let outputs = input
            .chunk(self.count.min(batch), 0)
            .into_iter()
            .map(forward)
            .collect();
        Tensor::cat(outputs, 0)
    }
}

/// A borrowed network whose forward passes go through [`Replicas::fan_out`].
#[derive(Debug, Clone, Copy)]
pub struct Replicated<'a, N> {
    network: &'a N,
    replicas: Replicas,
}

impl<B: Backend, N: StyleMapping<B>> StyleMapping<B> for Replicated<'_, N> {
    fn map_styles(&self, latent: Tensor<B, 2>) -> Tensor<B, 3> {
        self.replicas
            .fan_out(latent, |chunk| self.network.map_styles(chunk))
    }
}

impl<B: Backend, N: StyleGenerator<B>> StyleGenerator<B> for Replicated<'_, N> {
    fn synthesize(&self, styles: Tensor<B, 3>, lod: usize, blend_factor: f64) -> Tensor<B, 4> {
        self.replicas.fan_out(styles, |chunk| {
            self.network.synthesize(chunk, lod, blend_factor)
        })
    }

    fn layer_to_resolution(&self, lod: usize) -> usize {
        self.network.layer_to_resolution(lod)
    }
}

impl<B: Backend, N: Critic<B>> Critic<B> for Replicated<'_, N> {
    fn critique(&self, images: Tensor<B, 4>, lod: usize, blend_factor: f64) -> Tensor<B, 1> {
        self.replicas.fan_out(images, |chunk| {
            self.network.critique(chunk, lod, blend_factor)
        })
    }
}
