mod faulty_directory;

#[allow(unused_imports)]
pub use faulty_directory::{FaultConfig, FaultyDirectory};
