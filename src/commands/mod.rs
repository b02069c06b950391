pub mod daemon;
pub mod inspect;
pub mod utils;

pub use daemon::run;
pub use inspect::{init_config, recover, resolve, status};
