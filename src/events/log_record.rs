use serde::Deserialize;

/// One line of rclone's `--use-json-log` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogRecord {
    pub level: String,
    pub msg: String,
    pub object: Option<String>,
    #[serde(rename = "objectType")]
    pub object_type: Option<String>,
    pub size: Option<i64>,
    pub skipped: Option<String>,
    pub source: Option<String>,
    pub time: Option<String>,
}

impl LogRecord {
    pub fn parse(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    pub fn is_error(&self) -> bool {
        matches!(self.level.as_str(), "error" | "critical" | "alert" | "emergency")
    }

    /// rclone reports `-1` for sizes it doesn't know.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.and_then(|size| u64::try_from(size).ok())
    }

    /// Old path of a rename announced with `Renamed from "<path>"`.
    pub fn renamed_from(&self) -> Option<&str> {
        self.msg
            .trim()
            .strip_prefix("Renamed from \"")?
            .strip_suffix('"')
    }

    pub fn is_copy_completion(&self) -> bool {
        self.msg.starts_with("Copied")
    }
}
