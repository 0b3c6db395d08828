use clap::ValueEnum;

/// How the console answers when a backup finds changes above its threshold.
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OnLarge {
    /// Skip the whole backup until the changes are reviewed
    #[default]
    Skip,
    /// Back up everything except the large changes
    Exclude,
    /// Back up everything
    Include,
}
