pub mod barrier;
pub mod submit_info;
