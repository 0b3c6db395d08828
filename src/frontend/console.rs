use std::collections::HashSet;

use colored::Colorize;
use futures::StreamExt;
use futures::stream;
use futures_channel::mpsc::UnboundedReceiver;

use crate::application::data::OnLarge;
use crate::backup::{BackupEvent, BackupOutcome, Decision, DecisionRequest, LargeEntry};
use crate::ext::{TimestampExt, format_size};

enum Message {
    Event(BackupEvent),
    Decision(DecisionRequest),
}

/// Terminal stand-in for an interactive front end: prints notifications and answers reviews
/// with a fixed policy.
#[derive(Debug, Clone)]
pub struct Console {
    on_large: OnLarge,
}

impl Console {
    pub fn new(on_large: OnLarge) -> Self {
        Self { on_large }
    }

    /// Serves until both channels are closed.
    pub async fn serve(
        &self,
        events: UnboundedReceiver<BackupEvent>,
        requests: UnboundedReceiver<DecisionRequest>,
    ) {
        let mut messages = stream::select(
            events.map(Message::Event),
            requests.map(Message::Decision),
        );
        while let Some(message) = messages.next().await {
            match message {
                Message::Event(event) => {
                    if let Some(line) = render_event(&event) {
                        println!("{line}");
                    }
                }
                Message::Decision(request) => {
                    println!("{}", render_request(&request));
                    let decision = self.decide(&request.large_entries);
                    println!("{}", render_decision(&decision));
                    request.answer(decision);
                }
            }
        }
    }

    pub fn decide(&self, large_entries: &[LargeEntry]) -> Decision {
        match self.on_large {
            OnLarge::Skip => Decision::Skip,
            OnLarge::Exclude => Decision::Exclude(
                large_entries
                    .iter()
                    .map(|entry| entry.path.clone())
                    .collect(),
            ),
            OnLarge::Include => Decision::Exclude(HashSet::new()),
        }
    }

    pub fn print_outcome(&self, backup: &str, outcome: &BackupOutcome) {
        match outcome {
            BackupOutcome::Performed { transferred } => println!(
                "{} {backup}: transferred {}",
                "✓".green(),
                format_size(*transferred, false)
            ),
            BackupOutcome::Skipped(reason) => println!("{} {backup}: {reason}", "-".yellow()),
        }
    }

    pub fn print_version_sizes(destination: &str, sizes: &[(String, u64)]) {
        for line in version_size_lines(destination, sizes) {
            println!("{line}");
        }
    }

    pub fn print_history(destination: &str, history: &[(String, u64)]) {
        println!("Transferred to {destination}");
        for (version, bytes) in history {
            println!("{version:18} {:>12}", format_size(*bytes, true));
        }
    }
}

fn version_size_lines(destination: &str, sizes: &[(String, u64)]) -> Vec<String> {
    let mut lines = vec![format!("Size of versions in {destination}")];
    for (version, bytes) in sizes {
        lines.push(format!("{version:18} {:>12}", format_size(*bytes, true)));
    }
    let total: u64 = sizes.iter().map(|(_, bytes)| bytes).sum();
    lines.push(format!("{:18} {:>12}", "Total:", format_size(total, true)));
    lines
}

fn render_event(event: &BackupEvent) -> Option<String> {
    let line = match event {
        BackupEvent::StateChanged { .. } => return None,
        BackupEvent::StartBackup { backup, total } => {
            format!("{backup}: backing up {}", format_size(*total, false).bold())
        }
        BackupEvent::Progress {
            backup,
            transferred,
            total,
        } => format!(
            "{backup}: {} of {}",
            format_size(*transferred, false),
            format_size(*total, false)
        ),
        BackupEvent::AlreadyBackedUp { backup, timestamp } => format!(
            "{backup}: the view of {} was already backed up",
            timestamp
                .to_timestamp_string()
                .unwrap_or_else(|_| timestamp.to_string())
        )
        .yellow()
        .to_string(),
        BackupEvent::VolumeNotMounted { backup, source } => {
            format!("{backup}: {source} is not mounted").yellow().to_string()
        }
        BackupEvent::Failed {
            backup,
            message,
            details,
        } => {
            let mut text = format!("{backup}: {message}").red().to_string();
            for detail in details {
                text.push_str(&format!("\n    {detail}"));
            }
            text
        }
        BackupEvent::Finished {
            backup,
            transferred,
        } => format!(
            "{} {backup}: done, {} transferred",
            "✓".green(),
            format_size(*transferred, false)
        ),
    };
    Some(line)
}

fn render_request(request: &DecisionRequest) -> String {
    let mut text = format!(
        "{}: {} to back up, these changes are unusually large:",
        request.backup,
        format_size(request.total_size, false)
    )
    .yellow()
    .to_string();
    for entry in &request.large_entries {
        let marker = if entry.is_directory { "/" } else { "" };
        text.push_str(&format!(
            "\n{}   {}{marker}",
            format_size(entry.transfer_size, true),
            entry.path
        ));
    }
    text
}

fn render_decision(decision: &Decision) -> String {
    match decision {
        Decision::Skip => "Skipping the backup".to_string(),
        Decision::Exclude(paths) if paths.is_empty() => "Backing up everything".to_string(),
        Decision::Exclude(paths) => format!("Leaving out {} large changes", paths.len()),
    }
}
