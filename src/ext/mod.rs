mod size_format;
mod timestamp;

pub use size_format::format_size;
pub use timestamp::{SystemTimeExt, TimestampExt, parse_timestamp};
