pub mod breakout;
pub mod log;
pub mod ql;
pub mod util;
