pub mod logging;
pub mod time;

pub use logging::{init_logging, truncate_text};
