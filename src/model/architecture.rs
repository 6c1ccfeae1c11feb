use burn::{
    module::Param,
    nn::{
        LeakyRelu, LeakyReluConfig, Linear, LinearConfig, PaddingConfig2d, Tanh,
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig},
    },
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

use crate::model::constants::{BASE_RESOLUTION, CHANNELS, LATENT_DIM};
use crate::model::network::{Critic, Networks, StyleGenerator, StyleMapping};

pub type StyleGan<B> = Networks<MappingNetwork<B>, Generator<B>, Discriminator<B>>;

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 4)]
    pub layer_count: usize,
    #[config(default = "CHANNELS")]
    pub channels: usize,
    #[config(default = "LATENT_DIM")]
    pub latent_dim: usize,
    #[config(default = 128)]
    pub w_dim: usize,
    #[config(default = 4)]
    pub mapping_layers: usize,
    #[config(default = 128)]
    pub max_features: usize,
    #[config(default = 16)]
    pub min_features: usize,
    #[config(default = "0.2")]
    pub leaky_relu_slope: f64,
}

#[derive(Module, Debug)]
pub struct MappingNetwork<B: Backend> {
    layers: Vec<Linear<B>>,
    activation: LeakyRelu,
    num_styles: usize,
    w_dim: usize,
}

#[derive(Module, Debug)]
pub struct Generator<B: Backend> {
    constant: Param<Tensor<B, 4>>,
    blocks: Vec<SynthesisBlock<B>>,
    to_rgb: Vec<Conv2d<B>>,
    activation: LeakyRelu,
    output: Tanh,
}

#[derive(Module, Debug)]
pub struct SynthesisBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
    style1: Linear<B>,
    style2: Linear<B>,
    upsample: bool,
}

#[derive(Module, Debug)]
pub struct Discriminator<B: Backend> {
    from_rgb: Vec<Conv2d<B>>,
    // blocks[k - 1] halves level k down to level k - 1; level 0 feeds the head directly.
    blocks: Vec<DiscriminatorBlock<B>>,
    head_conv: Conv2d<B>,
    head_out: Linear<B>,
    activation: LeakyRelu,
    pool: AvgPool2d,
}

#[derive(Module, Debug)]
pub struct DiscriminatorBlock<B: Backend> {
    conv1: Conv2d<B>,
    conv2: Conv2d<B>,
}

fn conv3x3<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [3, 3])
        .with_padding(PaddingConfig2d::Explicit(1, 1))
        .init(device)
}

fn conv1x1<B: Backend>(channels: [usize; 2], device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new(channels, [1, 1]).init(device)
}

fn upsample2x<B: Backend>(x: Tensor<B, 4>) -> Tensor<B, 4> {
    let [_, _, height, width] = x.dims();
    interpolate(
        x,
        [height * 2, width * 2],
        InterpolateOptions::new(InterpolateMode::Nearest),
    )
}

impl ModelConfig {
    /// Feature maps at a given level: `max_features` at 4x4, halved per level.
    pub fn features(&self, lod: usize) -> usize {
        (self.max_features >> lod.min(usize::BITS as usize - 1)).max(self.min_features)
    }

    pub fn num_styles(&self) -> usize {
        2 * self.layer_count
    }

    pub fn init<B: Backend>(&self, device: &B::Device) -> StyleGan<B> {
        Networks {
            mapping: self.init_mapping(device),
            generator: self.init_generator(device),
            discriminator: self.init_discriminator(device),
        }
    }

    pub fn init_mapping<B: Backend>(&self, device: &B::Device) -> MappingNetwork<B> {
        let depth = self.mapping_layers.max(1);
        let layers = (0..depth)
            .map(|i| {
                let input = if i == 0 { self.latent_dim } else { self.w_dim };
                let output = if i + 1 == depth {
                    self.w_dim * self.num_styles()
                } else {
                    self.w_dim
                };
                LinearConfig::new(input, output).init(device)
            })
            .collect();

        MappingNetwork {
            layers,
            activation: self.leaky_relu(),
            num_styles: self.num_styles(),
            w_dim: self.w_dim,
        }
    }

    pub fn init_generator<B: Backend>(&self, device: &B::Device) -> Generator<B> {
        let base = self.features(0);
        let blocks = (0..self.layer_count)
            .map(|lod| {
                let input = if lod == 0 { base } else { self.features(lod - 1) };
                let output = self.features(lod);
                SynthesisBlock {
                    conv1: conv3x3([input, output], device),
                    conv2: conv3x3([output, output], device),
                    style1: LinearConfig::new(self.w_dim, 2 * output).init(device),
                    style2: LinearConfig::new(self.w_dim, 2 * output).init(device),
                    upsample: lod > 0,
                }
            })
            .collect();
        let to_rgb = (0..self.layer_count)
            .map(|lod| conv1x1([self.features(lod), self.channels], device))
            .collect();

        Generator {
            constant: Param::from_tensor(Tensor::ones(
                [1, base, BASE_RESOLUTION, BASE_RESOLUTION],
                device,
            )),
            blocks,
            to_rgb,
            activation: self.leaky_relu(),
            output: Tanh::new(),
        }
    }

    pub fn init_discriminator<B: Backend>(&self, device: &B::Device) -> Discriminator<B> {
        let base = self.features(0);
        let from_rgb = (0..self.layer_count)
            .map(|lod| conv1x1([self.channels, self.features(lod)], device))
            .collect();
        let blocks = (1..self.layer_count)
            .map(|lod| {
                let features = self.features(lod);
                DiscriminatorBlock {
                    conv1: conv3x3([features, features], device),
                    conv2: conv3x3([features, self.features(lod - 1)], device),
                }
            })
            .collect();

        Discriminator {
            from_rgb,
            blocks,
            head_conv: conv3x3([base, base], device),
            head_out: LinearConfig::new(base * BASE_RESOLUTION * BASE_RESOLUTION, 1).init(device),
            activation: self.leaky_relu(),
            pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    fn leaky_relu(&self) -> LeakyRelu {
        LeakyReluConfig::new()
            .with_negative_slope(self.leaky_relu_slope)
            .init()
    }
}

impl<B: Backend> StyleMapping<B> for MappingNetwork<B> {
    fn map_styles(&self, latent: Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, _] = latent.dims();
        // Pixel norm keeps every latent on the unit hypersphere.
        let norm = latent
            .clone()
            .powf_scalar(2.0)
            .mean_dim(1)
            .add_scalar(1e-8)
            .sqrt();
        let mut x = latent / norm;

        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if i != last {
                x = self.activation.forward(x);
            }
        }
        x.reshape([batch, self.num_styles, self.w_dim])
    }
}

impl<B: Backend> SynthesisBlock<B> {
    pub fn forward(
        &self,
        input: Tensor<B, 4>,
        styles: [Tensor<B, 2>; 2],
        activation: &LeakyRelu,
    ) -> Tensor<B, 4> {
        let [first, second] = styles;
        let mut x = if self.upsample { upsample2x(input) } else { input };

        x = self.conv1.forward(x);
        x = activation.forward(x);
        x = modulate(x, self.style1.forward(first));

        x = self.conv2.forward(x);
        x = activation.forward(x);
        modulate(x, self.style2.forward(second))
    }
}

/// Adaptive instance norm: per-sample, per-channel normalisation followed by a
/// style-driven scale (around 1) and bias.
fn modulate<B: Backend>(x: Tensor<B, 4>, style: Tensor<B, 2>) -> Tensor<B, 4> {
    let [batch, channels, _, _] = x.dims();
    let mean = x.clone().mean_dim(2).mean_dim(3);
    let centered = x - mean;
    let variance = centered.clone().powf_scalar(2.0).mean_dim(2).mean_dim(3);
    let normalized = centered / variance.add_scalar(1e-8).sqrt();

    let scale = style
        .clone()
        .narrow(1, 0, channels)
        .reshape([batch, channels, 1, 1])
        .add_scalar(1.0);
    let bias = style
        .narrow(1, channels, channels)
        .reshape([batch, channels, 1, 1]);
    normalized * scale + bias
}

impl<B: Backend> Generator<B> {
    fn style_pair(styles: &Tensor<B, 3>, lod: usize) -> [Tensor<B, 2>; 2] {
        let [batch, _, w_dim] = styles.dims();
        let site = |i: usize| styles.clone().narrow(1, i, 1).reshape([batch, w_dim]);
        [site(2 * lod), site(2 * lod + 1)]
    }

    fn max_lod(&self) -> usize {
        self.blocks.len() - 1
    }
}

impl<B: Backend> StyleGenerator<B> for Generator<B> {
    fn synthesize(&self, styles: Tensor<B, 3>, lod: usize, blend_factor: f64) -> Tensor<B, 4> {
        let [batch, _, _] = styles.dims();
        let lod = lod.min(self.max_lod());
        let fading = lod > 0 && blend_factor < 1.0;

        let mut x = self.constant.val().repeat_dim(0, batch);
        let mut previous_rgb = None;
        for (i, block) in self.blocks.iter().take(lod + 1).enumerate() {
            if fading && i == lod {
                previous_rgb = Some(upsample2x(self.to_rgb[lod - 1].forward(x.clone())));
            }
            x = block.forward(x, Self::style_pair(&styles, i), &self.activation);
        }

        let mut rgb = self.to_rgb[lod].forward(x);
        if let Some(previous) = previous_rgb {
            rgb = rgb * blend_factor + previous * (1.0 - blend_factor);
        }
        self.output.forward(rgb)
    }

    fn layer_to_resolution(&self, lod: usize) -> usize {
        BASE_RESOLUTION << lod.min(self.max_lod())
    }
}

impl<B: Backend> DiscriminatorBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>, activation: &LeakyRelu) -> Tensor<B, 4> {
        let x = activation.forward(self.conv1.forward(input));
        activation.forward(self.conv2.forward(x))
    }
}

impl<B: Backend> Critic<B> for Discriminator<B> {
    fn critique(&self, images: Tensor<B, 4>, lod: usize, blend_factor: f64) -> Tensor<B, 1> {
        let [batch, _, _, _] = images.dims();
        let lod = lod.min(self.from_rgb.len() - 1);

        let mut x = self
            .activation
            .forward(self.from_rgb[lod].forward(images.clone()));
        if lod > 0 {
            x = self
                .pool
                .forward(self.blocks[lod - 1].forward(x, &self.activation));
            if blend_factor < 1.0 {
                let skip = self
                    .activation
                    .forward(self.from_rgb[lod - 1].forward(self.pool.forward(images)));
                x = x * blend_factor + skip * (1.0 - blend_factor);
            }
            for block in self.blocks[..lod - 1].iter().rev() {
                x = self.pool.forward(block.forward(x, &self.activation));
            }
        }

        x = self.activation.forward(self.head_conv.forward(x));
        let [_, channels, height, width] = x.dims();
        let x = x.reshape([batch, channels * height * width]);
        self.head_out.forward(x).reshape([batch])
    }
}
