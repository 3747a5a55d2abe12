pub mod checkpoint;
pub mod learner;
pub mod model;
pub mod replay_buffer;
