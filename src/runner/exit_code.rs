/// Meaning of rclone's exit codes, see <https://rclone.org/docs/#exit-code>.
pub fn exit_code_meaning(code: i32) -> &'static str {
    match code {
        0 => "Success",
        1 => "Syntax or usage error",
        2 => "Error not otherwise categorised",
        3 => "Directory not found",
        4 => "File not found",
        5 => "Temporary error (one that more retries might fix) (Retry errors)",
        6 => "Less serious errors (like 461 errors from dropbox) (NoRetry errors)",
        7 => "Fatal error (one that more retries won't fix, like account suspended) (Fatal errors)",
        8 => "Transfer exceeded - limit set by --max-transfer reached",
        9 => "Operation successful, but no files transferred",
        -1 => "Terminated by a signal",
        _ => "Unknown exit code",
    }
}

/// Fields of the statistics block rclone prints when it finishes.
const STATUS_FIELDS: [&str; 6] = [
    "Transferred",
    "Errors",
    "Checks",
    "Deleted",
    "Renamed",
    "Elapsed time",
];

/// Lines of a log message that belong to the final statistics block.
pub fn status_summary(message: &str) -> Vec<String> {
    message
        .lines()
        .map(str::trim)
        .filter(|line| {
            STATUS_FIELDS.iter().any(|field| {
                line.strip_prefix(field)
                    .is_some_and(|rest| rest.starts_with(':'))
            })
        })
        .map(String::from)
        .collect()
}
