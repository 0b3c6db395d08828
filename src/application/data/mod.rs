mod log_level;
mod on_large;

pub use log_level::LogLevel;
pub use on_large::OnLarge;
