pub mod environment;
pub mod mechanics;
