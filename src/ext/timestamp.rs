use std::time::SystemTime;

use time::{
    OffsetDateTime, PrimitiveDateTime, format_description::BorrowedFormatItem,
    macros::format_description,
};

/// Backup versions and run artifacts are named after timestamps like `2024-03-01-184500`.
const TIMESTAMP_FORMAT: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day]-[hour][minute][second]");

pub fn parse_timestamp(text: &str) -> Result<PrimitiveDateTime, time::error::Parse> {
    PrimitiveDateTime::parse(text, TIMESTAMP_FORMAT)
}

pub trait TimestampExt {
    fn to_timestamp_string(&self) -> Result<String, time::error::Format>;
}

impl TimestampExt for PrimitiveDateTime {
    fn to_timestamp_string(&self) -> Result<String, time::error::Format> {
        self.format(TIMESTAMP_FORMAT)
    }
}

pub trait SystemTimeExt {
    /// Whole seconds in UTC.
    fn to_timestamp(&self) -> PrimitiveDateTime;
}

impl SystemTimeExt for SystemTime {
    fn to_timestamp(&self) -> PrimitiveDateTime {
        let seconds = self
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or_default();
        let moment =
            OffsetDateTime::from_unix_timestamp(seconds).unwrap_or(OffsetDateTime::UNIX_EPOCH);
        PrimitiveDateTime::new(moment.date(), moment.time())
    }
}
