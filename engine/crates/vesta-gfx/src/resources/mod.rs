pub mod buffer;
pub mod image;
pub mod pipeline;
pub mod sampler;
