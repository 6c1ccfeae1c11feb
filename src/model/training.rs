use crate::model::{
    architecture::ModelConfig,
    checkpoint::{CheckpointManager, CheckpointSlot},
    data::{ShardBatcher, ShardFiles, ShardSource},
    loss::{DiscriminatorLoss, R1Penalty, d_logistic_simplegp, g_logistic_nonsaturating},
    network::{Critic, Networks, Replicas, StyleGenerator, StyleMapping},
    schedule::{LodSchedule, TrainingState, blend_real_batch},
};

use anyhow::{Context, Result, ensure};
use burn::{
    data::dataloader::DataLoaderBuilder,
    module::AutodiffModule,
    optim::{AdamConfig, GradientsParams, Optimizer},
    prelude::*,
    tensor::{Distribution, backend::AutodiffBackend},
};
use indicatif::ProgressBar;
use rand::{SeedableRng, rngs::StdRng};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer_g: AdamConfig,
    pub optimizer_d: AdamConfig,

    #[config(default = 18)]
    pub num_epochs: usize,

    #[config(default = 4)]
    pub epochs_per_lod: usize,

    /// Batch size of every level of detail.
    #[config(default = "vec![256, 128, 128, 128, 128]")]
    pub lod_2_batch: Vec<usize>,

    /// Fixed latents rendered into the per-epoch sample grid.
    #[config(default = 256)]
    pub sample_count: usize,

    #[config(default = 1e-3)]
    pub learning_rate: f64,

    #[config(default = 1e-3)]
    pub disc_learning_rate: f64,

    /// Mapping network step size relative to `learning_rate`.
    #[config(default = 0.01)]
    pub mapping_lr_scale: f64,

    #[config(default = 10.0)]
    pub r1_gamma: f64,

    #[config(default = 1e-2)]
    pub r1_probe_step: f64,

    #[config(default = 0)]
    pub fold: usize,

    #[config(default = "String::from(\".\")")]
    pub data_dir: String,

    #[config(default = 42)]
    pub seed: u64,

    #[config(default = 1)]
    pub replicas: usize,
}

impl TrainingConfig {
    /// Defaults of the reference run: Adam with betas (0.0, 0.99) on both sides.
    pub fn progressive() -> Self {
        let adam = AdamConfig::new().with_beta_1(0.0).with_beta_2(0.99);
        Self::new(ModelConfig::new(), adam.clone(), adam)
    }

    pub fn validate(&self) -> Result<()> {
        let layers = self.model.layer_count;
        ensure!(layers >= 1, "layer_count must be at least 1");
        ensure!(self.epochs_per_lod >= 1, "epochs_per_lod must be at least 1");
        ensure!(
            self.lod_2_batch.len() >= layers,
            "lod_2_batch has {} entries for {} layers",
            self.lod_2_batch.len(),
            layers
        );
        ensure!(
            self.lod_2_batch.iter().all(|&size| size >= 1),
            "batch sizes must be positive"
        );
        ensure!(self.replicas >= 1, "replicas must be at least 1");
        Ok(())
    }

    pub fn step_settings(&self) -> StepSettings {
        StepSettings {
            learning_rate: self.learning_rate,
            disc_learning_rate: self.disc_learning_rate,
            latent_dim: self.model.latent_dim,
            r1: R1Penalty {
                gamma: self.r1_gamma,
                probe_step: self.r1_probe_step,
            },
            replicas: Replicas::new(self.replicas),
        }
    }
}

/// Hyper-parameters read on every batch.
#[derive(Debug, Clone, Copy)]
pub struct StepSettings {
    pub learning_rate: f64,
    pub disc_learning_rate: f64,
    pub latent_dim: usize,
    pub r1: R1Penalty,
    pub replicas: Replicas,
}

/// Steps the generator and the mapping network from one backward pass, the mapping
/// network with a scaled learning rate.
pub struct SynthesisOptimizer<OM, OG> {
    mapping: OM,
    generator: OG,
    mapping_lr_scale: f64,
}

impl<OM, OG> SynthesisOptimizer<OM, OG> {
    pub fn new(mapping: OM, generator: OG, mapping_lr_scale: f64) -> Self {
        Self {
            mapping,
            generator,
            mapping_lr_scale,
        }
    }

    pub fn step<B, M, G>(
        &mut self,
        learning_rate: f64,
        mapping: M,
        generator: G,
        mut grads: B::Gradients,
    ) -> (M, G)
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
        G: AutodiffModule<B>,
        OM: Optimizer<M, B>,
        OG: Optimizer<G, B>,
    {
        let grads_g = GradientsParams::from_module(&mut grads, &generator);
        let grads_m = GradientsParams::from_module(&mut grads, &mapping);
        let generator = self.generator.step(learning_rate, generator, grads_g);
        let mapping = self
            .mapping
            .step(learning_rate * self.mapping_lr_scale, mapping, grads_m);
        (mapping, generator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepLosses {
    pub d_loss: f32,
    pub r1_penalty: f32,
    pub g_loss: f32,
}

/// Result of an admitted batch.
#[derive(Debug, Clone)]
pub struct StepOutcome<B: Backend> {
    pub losses: StepLosses,
    /// Blended real input the discriminator saw, detached.
    pub reals: Tensor<B, 4>,
}

/// Owns the three networks and their optimizers and runs the two-phase update.
pub struct GanTrainer<B, M, G, D, OM, OG, OD>
where
    B: AutodiffBackend,
{
    pub networks: Networks<M, G, D>,
    synthesis_optim: SynthesisOptimizer<OM, OG>,
    optim_d: OD,
    settings: StepSettings,
    _backend: PhantomData<B>,
}

impl<B, M, G, D, OM, OG, OD> GanTrainer<B, M, G, D, OM, OG, OD>
where
    B: AutodiffBackend,
    M: StyleMapping<B> + AutodiffModule<B>,
    G: StyleGenerator<B> + AutodiffModule<B>,
    D: Critic<B> + AutodiffModule<B>,
    OM: Optimizer<M, B>,
    OG: Optimizer<G, B>,
    OD: Optimizer<D, B>,
{
    pub fn new(
        networks: Networks<M, G, D>,
        synthesis_optim: SynthesisOptimizer<OM, OG>,
        optim_d: OD,
        settings: StepSettings,
    ) -> Self {
        Self {
            networks,
            synthesis_optim,
            optim_d,
            settings,
            _backend: PhantomData,
        }
    }

    pub fn resolution(&self, lod: usize) -> usize {
        self.networks.generator.layer_to_resolution(lod)
    }

    fn sample_latent(&self, batch_size: usize, device: &B::Device) -> Tensor<B, 2> {
        Tensor::<B, 2>::random(
            [batch_size, self.settings.latent_dim],
            Distribution::Normal(0.0, 1.0),
            device,
        )
    }

    /// Renders a fresh latent draw; the output stays attached to the synthesis graph.
    fn generate(
        &self,
        batch_size: usize,
        lod: usize,
        blend_factor: f64,
        device: &B::Device,
    ) -> Tensor<B, 4> {
        let replicas = self.settings.replicas;
        let styles = replicas
            .wrap(&self.networks.mapping)
            .map_styles(self.sample_latent(batch_size, device));
        replicas
            .wrap(&self.networks.generator)
            .synthesize(styles, lod, blend_factor)
    }

    /// Discriminator loss on `reals` against a detached fake batch.
    pub fn discriminator_loss(
        &self,
        reals: Tensor<B, 4>,
        lod: usize,
        blend_factor: f64,
    ) -> DiscriminatorLoss<B> {
        let batch_size = reals.dims()[0];
        let device = reals.device();
        let critic = self.settings.replicas.wrap(&self.networks.discriminator);

        let fakes = self.generate(batch_size, lod, blend_factor, &device).detach();
        let d_real = critic.critique(reals.clone(), lod, blend_factor);
        let d_fake = critic.critique(fakes, lod, blend_factor);

        d_logistic_simplegp(
            &critic,
            reals,
            d_real,
            d_fake,
            lod,
            blend_factor,
            self.settings.r1,
        )
    }

    /// Generator loss on a second, independent latent draw.
    pub fn generator_loss(
        &self,
        batch_size: usize,
        lod: usize,
        blend_factor: f64,
        device: &B::Device,
    ) -> Tensor<B, 1> {
        let fakes = self.generate(batch_size, lod, blend_factor, device);
        let d_fake = self
            .settings
            .replicas
            .wrap(&self.networks.discriminator)
            .critique(fakes, lod, blend_factor);
        g_logistic_nonsaturating(d_fake)
    }

    /// Runs one discriminator update then one generator update.
    ///
    /// Batches whose size differs from `batch_size` never reach the networks.
    pub fn train_batch(
        &mut self,
        images: Tensor<B, 4>,
        state: &TrainingState,
        batch_size: usize,
    ) -> Option<StepOutcome<B>> {
        if images.dims()[0] != batch_size {
            return None;
        }
        let lod = state.lod();
        let blend_factor = state.blend_factor;
        let device = images.device();

        let reals = if state.in_transition && lod > 0 {
            blend_real_batch(images, self.resolution(lod - 1), blend_factor)
        } else {
            images
        }
        .detach();

        // --- 1. Train the Discriminator --- //
        let loss_d = self.discriminator_loss(reals.clone(), lod, blend_factor);
        let d_loss = loss_d.total.clone().into_scalar().elem::<f32>();
        let grads_d =
            GradientsParams::from_grads(loss_d.total.backward(), &self.networks.discriminator);
        self.networks.discriminator = self.optim_d.step(
            self.settings.disc_learning_rate,
            self.networks.discriminator.clone(),
            grads_d,
        );

        // --- 2. Train the Generator and the Mapping network --- //
        let loss_g = self.generator_loss(batch_size, lod, blend_factor, &device);
        let g_loss = loss_g.clone().into_scalar().elem::<f32>();
        let (mapping, generator) = self.synthesis_optim.step::<B, M, G>(
            self.settings.learning_rate,
            self.networks.mapping.clone(),
            self.networks.generator.clone(),
            loss_g.backward(),
        );
        self.networks.mapping = mapping;
        self.networks.generator = generator;

        Some(StepOutcome {
            losses: StepLosses {
                d_loss,
                r1_penalty: loss_d.r1_penalty,
                g_loss,
            },
            reals,
        })
    }

    /// Renders `latents` without tracking gradients.
    pub fn render(
        &self,
        latents: Tensor<B::InnerBackend, 2>,
        lod: usize,
        blend_factor: f64,
    ) -> Tensor<B::InnerBackend, 4>
    where
        M::InnerModule: StyleMapping<B::InnerBackend>,
        G::InnerModule: StyleGenerator<B::InnerBackend>,
    {
        let mapping = self.networks.mapping.valid();
        let generator = self.networks.generator.valid();
        generator.synthesize(mapping.map_styles(latents), lod, blend_factor)
    }
}

/// Per-epoch means and counters.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    pub epoch: usize,
    pub lod: usize,
    pub in_transition: bool,
    pub admitted_batches: usize,
    pub skipped_batches: usize,
    pub d_loss: f32,
    pub g_loss: f32,
    pub r1_penalty: f32,
    pub last_blend_factor: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingReport {
    pub shard_loads: usize,
    pub checkpoint_writes: usize,
    pub final_writes: usize,
    pub epochs: Vec<EpochSummary>,
}

#[derive(Default)]
struct LossMeans {
    d_loss: f32,
    g_loss: f32,
    r1_penalty: f32,
    count: usize,
}

impl LossMeans {
    fn push(&mut self, losses: &StepLosses) {
        self.d_loss += losses.d_loss;
        self.g_loss += losses.g_loss;
        self.r1_penalty += losses.r1_penalty;
        self.count += 1;
    }

    fn mean(&self, total: f32) -> f32 {
        if self.count == 0 {
            0.0
        } else {
            total / self.count as f32
        }
    }
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(artifact_dir)
        .with_context(|| format!("cannot create '{}'", artifact_dir.display()))
}

/// Trains the default networks on the shards under `config.data_dir`.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: TrainingConfig,
    device: B::Device,
) -> Result<TrainingReport> {
    config.validate()?;
    create_artifact_dir(artifact_dir)?;
    config
        .save(artifact_dir.join("config.json"))
        .context("config should be saved")?;

    B::seed(config.seed);

    let networks = config.model.init::<B>(&device);
    tracing::info!(
        mapping = networks.mapping.num_params(),
        generator = networks.generator.num_params(),
        discriminator = networks.discriminator.num_params(),
        "trainable parameters"
    );
    let settings = config.step_settings();
    if settings.replicas.count() > 1 {
        tracing::info!(replicas = settings.replicas.count(), "splitting forward passes");
    }

    let synthesis_optim = SynthesisOptimizer::new(
        config.optimizer_g.init(),
        config.optimizer_g.init(),
        config.mapping_lr_scale,
    );
    let mut trainer: GanTrainer<B, _, _, _, _, _, _> = GanTrainer::new(
        networks,
        synthesis_optim,
        config.optimizer_d.init(),
        settings,
    );

    let mut shards = ShardFiles::new(&config.data_dir, config.fold);
    let checkpoints = CheckpointManager::new(artifact_dir)?;
    run(&config, &mut trainer, &mut shards, &checkpoints, &device)
}

/// The epoch loop: curriculum bookkeeping, shard reloads, batches, samples, checkpoints.
pub fn run<B, M, G, D, OM, OG, OD, S>(
    config: &TrainingConfig,
    trainer: &mut GanTrainer<B, M, G, D, OM, OG, OD>,
    shards: &mut S,
    checkpoints: &CheckpointManager,
    device: &B::Device,
) -> Result<TrainingReport>
where
    B: AutodiffBackend,
    M: StyleMapping<B> + AutodiffModule<B>,
    G: StyleGenerator<B> + AutodiffModule<B>,
    D: Critic<B> + AutodiffModule<B>,
    M::InnerModule: StyleMapping<B::InnerBackend>,
    G::InnerModule: StyleGenerator<B::InnerBackend>,
    OM: Optimizer<M, B>,
    OG: Optimizer<G, B>,
    OD: Optimizer<D, B>,
    S: ShardSource,
{
    config.validate()?;
    let schedule = LodSchedule::new(config.model.layer_count, config.epochs_per_lod);
    let mut rng = StdRng::seed_from_u64(config.seed);
    let fixed_latents = Tensor::<B::InnerBackend, 2>::random(
        [config.sample_count, config.model.latent_dim],
        Distribution::Normal(0.0, 1.0),
        device,
    );

    let mut report = TrainingReport::default();
    let mut state = TrainingState::default();
    let mut shard = None;

    for epoch in 0..config.num_epochs {
        let (next, change) = state.enter_epoch(&schedule, epoch);
        state = next;
        let lod = state.lod();
        let resolution = trainer.resolution(lod);

        if change.lod_changed {
            tracing::info!(lod, resolution, "switching LOD");
            let mut loaded = shards
                .load(lod)
                .with_context(|| format!("cannot load the shard for lod {lod}"))?;
            loaded.validate(lod, resolution, config.model.channels)?;
            loaded.shuffle(&mut rng);
            tracing::info!(
                samples = loaded.samples.len(),
                labels = loaded.label_count(),
                "train set loaded"
            );
            report.shard_loads += 1;
            shard = Some(Arc::new(loaded));
        }
        if change.transition_started {
            tracing::info!(lod, "transition started");
        }
        if change.transition_ended {
            tracing::info!(lod, "transition ended");
        }
        let shard = shard.clone().context("no shard loaded for the current LOD")?;

        let batch_size = config.lod_2_batch[lod];
        let data_size = shard.samples.len();
        // Single-threaded: worker splits would each end in a short tail batch.
        let dataloader =
            DataLoaderBuilder::new(ShardBatcher::new(resolution, config.model.channels))
                .batch_size(batch_size)
                .shuffle(config.seed.wrapping_add(epoch as u64))
                .build(shard);

        let epoch_start = Instant::now();
        let progress = ProgressBar::new(data_size as u64);
        let mut means = LossMeans::default();
        let mut samples_seen = 0;
        let mut skipped = 0;
        let mut last_reals = None;

        for batch in dataloader.iter() {
            let images = batch.images.to_device(device);
            state = state.at_sample(&schedule, samples_seen, data_size);
            match trainer.train_batch(images, &state, batch_size) {
                Some(outcome) => {
                    means.push(&outcome.losses);
                    samples_seen += batch_size;
                    progress.inc(batch_size as u64);
                    last_reals = Some(outcome.reals);
                }
                None => {
                    skipped += 1;
                    tracing::debug!(epoch, lod, "skipped a short batch");
                }
            }
        }
        progress.finish_and_clear();

        let summary = EpochSummary {
            epoch,
            lod,
            in_transition: state.in_transition,
            admitted_batches: means.count,
            skipped_batches: skipped,
            d_loss: means.mean(means.d_loss),
            g_loss: means.mean(means.g_loss),
            r1_penalty: means.mean(means.r1_penalty),
            last_blend_factor: state.blend_factor,
        };
        tracing::info!(
            admitted = summary.admitted_batches,
            skipped = summary.skipped_batches,
            "[{}/{}] - ptime: {:.2}, g loss: {:.9}, d loss: {:.9}, r1: {:.9}",
            epoch + 1,
            config.num_epochs,
            epoch_start.elapsed().as_secs_f32(),
            summary.g_loss,
            summary.d_loss,
            summary.r1_penalty,
        );

        match last_reals {
            Some(reals) => {
                let renders = trainer.render(fixed_latents.clone(), lod, state.blend_factor);
                let path = checkpoints.save_samples(reals.inner(), renders, epoch, means.count)?;
                tracing::debug!("sample grid written to '{}'", path.display());
            }
            None => tracing::warn!(epoch, "no batch admitted, sample grid skipped"),
        }

        checkpoints.save_networks::<B, _, _, _>(&trainer.networks, CheckpointSlot::Epoch)?;
        report.checkpoint_writes += 1;
        report.epochs.push(summary);
    }

    tracing::info!("Training finish!... save training results");
    checkpoints.save_networks::<B, _, _, _>(&trainer.networks, CheckpointSlot::Final)?;
    report.final_writes += 1;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::architecture::{Discriminator, Generator, MappingNetwork};
    use crate::model::data::tests::synthetic_shard;
    use crate::model::data::{Shard, ShardError};
    use burn::backend::{Autodiff, NdArray};
    use burn::module::Ignored;
    use std::sync::atomic::{AtomicUsize, Ordering};

    type TestBackend = Autodiff<NdArray<f32>>;

    #[derive(Module, Debug)]
    struct CountingMapping<B: Backend> {
        inner: MappingNetwork<B>,
        calls: Ignored<Arc<AtomicUsize>>,
    }

    #[derive(Module, Debug)]
    struct CountingGenerator<B: Backend> {
        inner: Generator<B>,
        calls: Ignored<Arc<AtomicUsize>>,
    }

    #[derive(Module, Debug)]
    struct CountingCritic<B: Backend> {
        inner: Discriminator<B>,
        calls: Ignored<Arc<AtomicUsize>>,
    }

    impl<B: Backend> StyleMapping<B> for CountingMapping<B> {
        fn map_styles(&self, latent: Tensor<B, 2>) -> Tensor<B, 3> {
            self.calls.0.fetch_add(1, Ordering::SeqCst);
            self.inner.map_styles(latent)
        }
    }

    impl<B: Backend> StyleGenerator<B> for CountingGenerator<B> {
        fn synthesize(&self, styles: Tensor<B, 3>, lod: usize, blend_factor: f64) -> Tensor<B, 4> {
            self.calls.0.fetch_add(1, Ordering::SeqCst);
            self.inner.synthesize(styles, lod, blend_factor)
        }

        fn layer_to_resolution(&self, lod: usize) -> usize {
            self.inner.layer_to_resolution(lod)
        }
    }

    impl<B: Backend> Critic<B> for CountingCritic<B> {
        fn critique(&self, images: Tensor<B, 4>, lod: usize, blend_factor: f64) -> Tensor<B, 1> {
            self.calls.0.fetch_add(1, Ordering::SeqCst);
            self.inner.critique(images, lod, blend_factor)
        }
    }

    struct Counters {
        mapping: Arc<AtomicUsize>,
        generator: Arc<AtomicUsize>,
        critic: Arc<AtomicUsize>,
    }

    fn small_config(layer_count: usize) -> TrainingConfig {
        let model = ModelConfig::new()
            .with_layer_count(layer_count)
            .with_max_features(8)
            .with_min_features(4)
            .with_w_dim(8)
            .with_mapping_layers(2);
        let adam = AdamConfig::new().with_beta_1(0.0).with_beta_2(0.99);
        TrainingConfig::new(model, adam.clone(), adam)
            .with_sample_count(4)
    }

    fn counting_trainer(
        config: &TrainingConfig,
    ) -> (
        GanTrainer<
            TestBackend,
            CountingMapping<TestBackend>,
            CountingGenerator<TestBackend>,
            CountingCritic<TestBackend>,
            impl Optimizer<CountingMapping<TestBackend>, TestBackend>,
            impl Optimizer<CountingGenerator<TestBackend>, TestBackend>,
            impl Optimizer<CountingCritic<TestBackend>, TestBackend>,
        >,
        Counters,
    ) {
        let device = Default::default();
        let networks = config.model.init::<TestBackend>(&device);
        let counters = Counters {
            mapping: Arc::new(AtomicUsize::new(0)),
            generator: Arc::new(AtomicUsize::new(0)),
            critic: Arc::new(AtomicUsize::new(0)),
        };
        let networks = Networks {
            mapping: CountingMapping {
                inner: networks.mapping,
                calls: Ignored(counters.mapping.clone()),
            },
            generator: CountingGenerator {
                inner: networks.generator,
                calls: Ignored(counters.generator.clone()),
            },
            discriminator: CountingCritic {
                inner: networks.discriminator,
                calls: Ignored(counters.critic.clone()),
            },
        };
        let trainer = GanTrainer::new(
            networks,
            SynthesisOptimizer::new(
                config.optimizer_g.init(),
                config.optimizer_g.init(),
                config.mapping_lr_scale,
            ),
            config.optimizer_d.init(),
            config.step_settings(),
        );
        (trainer, counters)
    }

    fn lod_state(lod: usize, in_transition: bool, blend_factor: f64) -> TrainingState {
        TrainingState {
            epoch: 0,
            lod: Some(lod),
            in_transition,
            blend_factor,
        }
    }

    fn real_batch(batch: usize, resolution: usize) -> Tensor<TestBackend, 4> {
        Tensor::random(
            [batch, 1, resolution, resolution],
            Distribution::Uniform(-1.0, 1.0),
            &Default::default(),
        )
    }

    #[test]
    fn default_config_matches_the_reference_run() {
        let config = TrainingConfig::progressive();
        assert!(config.validate().is_ok());
        assert_eq!(config.num_epochs, 18);
        assert_eq!(config.lod_2_batch, vec![256, 128, 128, 128, 128]);
        assert_eq!(config.model.layer_count, 4);
        assert_eq!(config.mapping_lr_scale, 0.01);
    }

    #[test]
    fn validation_rejects_short_batch_tables() {
        let config = small_config(3).with_lod_2_batch(vec![4, 2]);
        assert!(config.validate().is_err());
        let config = small_config(2).with_epochs_per_lod(0);
        assert!(config.validate().is_err());
        let config = small_config(2).with_lod_2_batch(vec![4, 0]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn wrong_sized_batches_never_reach_the_networks() {
        let config = small_config(2);
        let (mut trainer, counters) = counting_trainer(&config);
        let state = lod_state(0, false, 1.0);

        assert!(trainer.train_batch(real_batch(3, 4), &state, 4).is_none());
        assert!(trainer.train_batch(real_batch(5, 4), &state, 4).is_none());
        assert_eq!(counters.mapping.load(Ordering::SeqCst), 0);
        assert_eq!(counters.generator.load(Ordering::SeqCst), 0);
        assert_eq!(counters.critic.load(Ordering::SeqCst), 0);

        let outcome = trainer.train_batch(real_batch(4, 4), &state, 4).unwrap();
        assert!(outcome.losses.d_loss.is_finite());
        assert!(outcome.losses.g_loss.is_finite());
        assert!(counters.critic.load(Ordering::SeqCst) > 0);
    }

    #[test]
    fn every_step_draws_two_independent_fake_batches() {
        let config = small_config(2);
        let (mut trainer, counters) = counting_trainer(&config);

        trainer
            .train_batch(real_batch(2, 8), &lod_state(1, true, 0.4), 2)
            .unwrap();
        assert_eq!(counters.mapping.load(Ordering::SeqCst), 2);
        assert_eq!(counters.generator.load(Ordering::SeqCst), 2);

        trainer
            .train_batch(real_batch(2, 8), &lod_state(1, false, 1.0), 2)
            .unwrap();
        assert_eq!(counters.generator.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn discriminator_phase_does_not_reach_the_synthesis_networks() {
        let config = small_config(2);
        let device = Default::default();
        let (trainer, _) = counting_trainer(&config);
        let networks = &trainer.networks;

        let loss_d = trainer.discriminator_loss(real_batch(2, 8), 1, 0.5);
        let mut grads = loss_d.total.backward();
        assert!(GradientsParams::from_module(&mut grads, &networks.generator).is_empty());
        assert!(GradientsParams::from_module(&mut grads, &networks.mapping).is_empty());
        assert!(!GradientsParams::from_module(&mut grads, &networks.discriminator).is_empty());

        let loss_g = trainer.generator_loss(2, 1, 0.5, &device);
        let mut grads = loss_g.backward();
        assert!(!GradientsParams::from_module(&mut grads, &networks.generator).is_empty());
        assert!(!GradientsParams::from_module(&mut grads, &networks.mapping).is_empty());
    }

    #[test]
    fn renders_fixed_latents_on_the_inner_backend() {
        let config = small_config(2);
        let (trainer, counters) = counting_trainer(&config);
        let latents = Tensor::<NdArray<f32>, 2>::random(
            [3, config.model.latent_dim],
            Distribution::Normal(0.0, 1.0),
            &Default::default(),
        );

        let images = trainer.render(latents, 1, 0.5);
        assert_eq!(images.dims(), [3, 1, 8, 8]);
        assert_eq!(counters.mapping.load(Ordering::SeqCst), 1);
        assert_eq!(counters.generator.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replicated_training_step_runs() {
        let config = small_config(2).with_replicas(2);
        let (mut trainer, counters) = counting_trainer(&config);
        let outcome = trainer
            .train_batch(real_batch(4, 4), &lod_state(0, false, 1.0), 4)
            .unwrap();
        assert!(outcome.losses.r1_penalty >= 0.0);
        // Every forward pass is split into two chunks.
        assert_eq!(counters.generator.load(Ordering::SeqCst), 4);
    }

    fn record_exists(checkpoints: &CheckpointManager, name: &str, slot: CheckpointSlot) -> bool {
        checkpoints.path(name, slot).with_extension("mpk").exists()
    }

    fn run_with<M, G, D, OM, OG, OD, S>(
        config: &TrainingConfig,
        trainer: &mut GanTrainer<TestBackend, M, G, D, OM, OG, OD>,
        shards: &mut S,
        checkpoints: &CheckpointManager,
    ) -> Result<TrainingReport>
    where
        M: StyleMapping<TestBackend> + AutodiffModule<TestBackend>,
        G: StyleGenerator<TestBackend> + AutodiffModule<TestBackend>,
        D: Critic<TestBackend> + AutodiffModule<TestBackend>,
        M::InnerModule: StyleMapping<NdArray<f32>>,
        G::InnerModule: StyleGenerator<NdArray<f32>>,
        OM: Optimizer<M, TestBackend>,
        OG: Optimizer<G, TestBackend>,
        OD: Optimizer<D, TestBackend>,
        S: ShardSource,
    {
        run(config, trainer, shards, checkpoints, &Default::default())
    }

    struct CountingShards {
        loads: Vec<usize>,
        len: usize,
    }

    impl ShardSource for CountingShards {
        fn load(&mut self, lod: usize) -> Result<Shard, ShardError> {
            self.loads.push(lod);
            Ok(synthetic_shard(self.len, 4 << lod, 1))
        }
    }

    struct FailingShards;

    impl ShardSource for FailingShards {
        fn load(&mut self, lod: usize) -> Result<Shard, ShardError> {
            Err(ShardError::Corrupt {
                lod,
                reason: "truncated".to_string(),
            })
        }
    }

    #[test]
    fn progressive_run_follows_the_curriculum() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(2)
            .with_epochs_per_lod(2)
            .with_lod_2_batch(vec![4, 2])
            .with_num_epochs(4);
        let (mut trainer, _) = counting_trainer(&config);
        let checkpoints = CheckpointManager::new(dir.path()).unwrap();
        let mut shards = CountingShards {
            loads: Vec::new(),
            len: 8,
        };

        let report = run_with(&config, &mut trainer, &mut shards, &checkpoints).unwrap();

        assert_eq!(shards.loads, vec![0, 1]);
        assert_eq!(report.shard_loads, 2);
        assert_eq!(report.checkpoint_writes, 4);
        assert_eq!(report.final_writes, 1);

        let lods: Vec<usize> = report.epochs.iter().map(|e| e.lod).collect();
        assert_eq!(lods, vec![0, 0, 1, 1]);
        let transitions: Vec<bool> = report.epochs.iter().map(|e| e.in_transition).collect();
        assert_eq!(transitions, vec![false, false, true, false]);
        let admitted: Vec<usize> = report.epochs.iter().map(|e| e.admitted_batches).collect();
        assert_eq!(admitted, vec![2, 2, 4, 4]);
        assert!((report.epochs[2].last_blend_factor - 0.75).abs() < 1e-9);
        assert_eq!(report.epochs[3].last_blend_factor, 1.0);

        for name in ["generator", "mapping", "discriminator"] {
            assert!(record_exists(&checkpoints, name, CheckpointSlot::Epoch));
            assert!(record_exists(&checkpoints, name, CheckpointSlot::Final));
        }
        assert!(checkpoints.sample_path(3, 4).exists());
    }

    #[test]
    fn short_batches_are_skipped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(1)
            .with_epochs_per_lod(1)
            .with_lod_2_batch(vec![4])
            .with_num_epochs(1);
        let (mut trainer, _) = counting_trainer(&config);
        let checkpoints = CheckpointManager::new(dir.path()).unwrap();
        let mut shards = CountingShards {
            loads: Vec::new(),
            len: 10,
        };

        let report = run_with(&config, &mut trainer, &mut shards, &checkpoints).unwrap();
        assert_eq!(report.epochs[0].admitted_batches, 2);
        assert_eq!(report.epochs[0].skipped_batches, 1);
    }

    #[test]
    fn whole_shard_is_served_in_full_batches() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(1)
            .with_epochs_per_lod(1)
            .with_lod_2_batch(vec![4])
            .with_num_epochs(2);
        let (mut trainer, _) = counting_trainer(&config);
        let checkpoints = CheckpointManager::new(dir.path()).unwrap();
        let mut shards = CountingShards {
            loads: Vec::new(),
            len: 24,
        };

        let report = run_with(&config, &mut trainer, &mut shards, &checkpoints).unwrap();
        for epoch in &report.epochs {
            assert_eq!(epoch.admitted_batches, 6);
            assert_eq!(epoch.skipped_batches, 0);
        }
    }

    #[test]
    fn shard_failures_abort_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = small_config(2).with_num_epochs(2);
        let (mut trainer, _) = counting_trainer(&config);
        let checkpoints = CheckpointManager::new(dir.path()).unwrap();

        let err = run_with(&config, &mut trainer, &mut FailingShards, &checkpoints).unwrap_err();
        assert!(format!("{err:#}").contains("truncated"));
        assert!(!record_exists(&checkpoints, "generator", CheckpointSlot::Epoch));
    }

    #[test]
    fn train_reads_shards_from_the_data_dir() {
        let data = tempfile::tempdir().unwrap();
        let artifacts = tempfile::tempdir().unwrap();
        let files = ShardFiles::new(data.path(), 0);
        crate::model::data::tests::write_shard(&files, 0, &synthetic_shard(4, 4, 1));

        let config = small_config(1)
            .with_lod_2_batch(vec![2])
            .with_num_epochs(1)
            .with_data_dir(data.path().display().to_string());
        let report = train::<TestBackend>(artifacts.path(), config, Default::default()).unwrap();

        assert_eq!(report.shard_loads, 1);
        assert!(artifacts.path().join("config.json").exists());
        assert!(artifacts.path().join("generator.mpk").exists());
    }
}
