pub mod pipeline;

pub use pipeline::{CdrMode, CdrPipeline};
