pub mod utils;
pub mod gpu;
pub mod job;

pub use gpu::*;
pub use utils::{Handle, Pool};
