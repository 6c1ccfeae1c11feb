use burn::{
    prelude::*,
    tensor::{
        module::interpolate,
        ops::{InterpolateMode, InterpolateOptions},
    },
};

/// Curriculum position of the training run.
///
/// Owned by the epoch loop and threaded through it by value: `enter_epoch` is applied
/// once per epoch and `at_sample` once per admitted batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainingState {
    pub epoch: usize,
    /// `None` until the first epoch has picked a level of detail.
    pub lod: Option<usize>,
    pub in_transition: bool,
    pub blend_factor: f64,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epoch: 0,
            lod: None,
            in_transition: false,
            blend_factor: 1.0,
        }
    }
}

/// What changed when the state moved into a new epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochChange {
    pub lod_changed: bool,
    pub transition_started: bool,
    pub transition_ended: bool,
}

impl TrainingState {
    pub fn lod(&self) -> usize {
        self.lod.unwrap_or(0)
    }

    pub fn enter_epoch(self, schedule: &LodSchedule, epoch: usize) -> (Self, EpochChange) {
        let (lod, lod_changed) = schedule.advance(epoch, self.lod);
        let in_transition = schedule.in_transition(epoch, lod);
        let change = EpochChange {
            lod_changed,
            transition_started: in_transition && (lod_changed || !self.in_transition),
            transition_ended: self.in_transition && !in_transition,
        };
        let state = Self {
            epoch,
            lod: Some(lod),
            in_transition,
            blend_factor: if in_transition { 0.0 } else { 1.0 },
        };
        (state, change)
    }

    /// Refreshes the blend factor for a batch that starts after `samples_seen` samples of
    /// this epoch.
    pub fn at_sample(self, schedule: &LodSchedule, samples_seen: usize, data_size: usize) -> Self {
        Self {
            blend_factor: schedule.blend_factor(
                self.epoch,
                samples_seen,
                data_size,
                self.in_transition,
            ),
            ..self
        }
    }
}

/// Maps epochs to levels of detail and to the fade-in window of each level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LodSchedule {
    layer_count: usize,
    epochs_per_lod: usize,
}

impl LodSchedule {
    pub fn new(layer_count: usize, epochs_per_lod: usize) -> Self {
        Self {
            layer_count: layer_count.max(1),
            epochs_per_lod: epochs_per_lod.max(1),
        }
    }

    pub fn max_lod(&self) -> usize {
        self.layer_count - 1
    }

    /// Number of epochs at the start of each level spent fading the level in.
    pub fn transition_epochs(&self) -> usize {
        self.epochs_per_lod / 2
    }

    pub fn lod_for_epoch(&self, epoch: usize) -> usize {
        (epoch / self.epochs_per_lod).min(self.max_lod())
    }

    /// Returns the level for `epoch` and whether it differs from `previous`.
    /// A run that has not picked a level yet always reports a change.
    pub fn advance(&self, epoch: usize, previous: Option<usize>) -> (usize, bool) {
        let lod = self.lod_for_epoch(epoch);
        (lod, previous != Some(lod))
    }

    pub fn in_transition(&self, epoch: usize, lod: usize) -> bool {
        lod > 0
            && epoch / self.epochs_per_lod == lod
            && epoch % self.epochs_per_lod < self.transition_epochs()
    }

    /// Linear fade-in weight of the new resolution, clamped to `[0, 1]`.
    /// Outside a transition the new resolution is used alone.
    pub fn blend_factor(
        &self,
        epoch: usize,
        samples_seen: usize,
        data_size: usize,
        in_transition: bool,
    ) -> f64 {
        if !in_transition || data_size == 0 || self.transition_epochs() == 0 {
            return 1.0;
        }
        let elapsed = (epoch % self.epochs_per_lod) * data_size + samples_seen;
        let window = self.transition_epochs() * data_size;
        let raw = elapsed as f64 / window as f64;
        if raw > 1.0 {
            tracing::debug!(epoch, samples_seen, raw, "blend factor clamped to 1.0");
        }
        raw.clamp(0.0, 1.0)
    }
}

/// Mixes a real batch with its previous-resolution rendition (nearest down, nearest up).
pub fn blend_real_batch<B: Backend>(
    images: Tensor<B, 4>,
    previous_resolution: usize,
    blend_factor: f64,
) -> Tensor<B, 4> {
    let [_, _, height, width] = images.dims();
    let nearest = || InterpolateOptions::new(InterpolateMode::Nearest);

    let coarse = interpolate(
        images.clone(),
        [previous_resolution, previous_resolution],
        nearest(),
    );
    let coarse = interpolate(coarse, [height, width], nearest());

    images * blend_factor + coarse * (1.0 - blend_factor)
}
