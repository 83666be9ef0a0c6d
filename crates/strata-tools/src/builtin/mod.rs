pub mod data;
pub mod math;
