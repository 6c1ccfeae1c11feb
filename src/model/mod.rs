pub mod architecture;
pub mod checkpoint;
pub mod constants;
pub mod data;
pub mod loss;
pub mod network;
pub mod schedule;
pub mod training;
