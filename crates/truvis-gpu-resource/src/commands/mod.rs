pub mod barrier;
pub mod submit_info;
pub mod submit_ring;
pub mod submit_token;
