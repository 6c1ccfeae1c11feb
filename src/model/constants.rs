/// Width of the latent vectors fed to the mapping network.
pub const LATENT_DIM: usize = 64;
/// Shards are grayscale unless the model config says otherwise.
pub const CHANNELS: usize = 1;
/// Resolution produced at LOD 0.
pub const BASE_RESOLUTION: usize = 4;

pub const GRID_COLUMNS: usize = 16;
pub const GRID_PADDING: u32 = 2;
pub const RESULTS_DIR: &str = "results_rec";
