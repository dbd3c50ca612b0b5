// Output formatting and display for CLI

use crate::ipc::protocol::{InstanceInfo, LogReport, StartReport};
use crate::logs::LogEntry;
use crate::process::Status;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tabled::{
    settings::{object::Rows, Alignment, Modify, Style},
    Table, Tabled,
};

/// Print the outcome of `start <config>`
pub fn print_start_report(report: &StartReport) {
    for info in &report.started {
        println!(
            "{} {} started (pid {})",
            "✓".green().bold(),
            instance_label(info).cyan(),
            info.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into())
        );
    }
    for rejected in &report.rejected {
        eprintln!(
            "{} {} rejected: {}",
            "✗".red().bold(),
            rejected.name.cyan(),
            rejected.message
        );
    }
    for failed in &report.launch_failures {
        eprintln!(
            "{} {} failed to launch: {}",
            "✗".red().bold(),
            failed.name.cyan(),
            failed.message
        );
    }

    if !report.started.is_empty() {
        print_status_table(&report.started);
    }
}

/// One line per instance after stop/restart/delete
pub fn print_instances(action: &str, instances: &[InstanceInfo]) {
    for info in instances {
        println!(
            "{} {} {} ({})",
            "✓".green().bold(),
            instance_label(info).cyan(),
            action,
            format_state_colored(info.status)
        );
    }
}

/// Print a formatted table of instances
pub fn print_status_table(instances: &[InstanceInfo]) {
    if instances.is_empty() {
        println!("{}", "No processes are managed".yellow());
        return;
    }

    #[derive(Tabled)]
    struct InstanceRow {
        #[tabled(rename = "Name")]
        name: String,
        #[tabled(rename = "#")]
        index: usize,
        #[tabled(rename = "Status")]
        status: String,
        #[tabled(rename = "PID")]
        pid: String,
        #[tabled(rename = "Uptime")]
        uptime: String,
        #[tabled(rename = "Restarts")]
        restarts: u64,
        #[tabled(rename = "Memory")]
        memory: String,
        #[tabled(rename = "Last exit")]
        last_exit: String,
    }

    let rows: Vec<InstanceRow> = instances
        .iter()
        .map(|i| InstanceRow {
            name: truncate(&i.name, 20),
            index: i.index,
            status: format_state_colored(i.status),
            pid: i
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".to_string()),
            uptime: i
                .uptime_secs
                .map(|s| format_duration(&Duration::from_secs(s)))
                .unwrap_or_else(|| "-".to_string()),
            restarts: i.restarts,
            memory: format_memory_usage(i.memory_bytes, i.memory_limit_bytes),
            last_exit: i
                .last_fault
                .as_deref()
                .map(|f| truncate(f, 32))
                .unwrap_or_else(|| "-".to_string()),
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::rounded())
        .with(Modify::new(Rows::first()).with(Alignment::center()));

    println!("\n{}\n", table);
    println!(
        "{}",
        format!("Total: {} instance(s)", instances.len())
            .dimmed()
            .italic()
    );
}

/// Header naming the files a block of log lines comes from
pub fn print_log_header(report: &LogReport, index: usize, merged: bool) {
    let Some(instance) = report.instances.iter().find(|i| i.index == index) else {
        return;
    };
    let title = format!("{}#{}", report.name, index);
    if merged {
        println!(
            "\n{} {}",
            title.bold().underline(),
            instance.paths.stdout.display().to_string().dimmed()
        );
    } else {
        println!(
            "\n{} {} {}",
            title.bold().underline(),
            instance.paths.stdout.display().to_string().dimmed(),
            instance.paths.stderr.display().to_string().dimmed()
        );
    }
}

pub fn print_log_entry(entry: &LogEntry) {
    let line = entry.format();
    match entry.source {
        crate::logs::LogSource::Stderr => println!("{}", line.red()),
        _ => println!("{}", line),
    }
}

/// Print an error message to stderr
pub fn print_error(error: &str) {
    eprintln!("{} {}", "✗ Error:".red().bold(), error);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

fn instance_label(info: &InstanceInfo) -> String {
    format!("{}#{}", info.name, info.index)
}

/// Format a status with color coding
fn format_state_colored(status: Status) -> String {
    let text = status.to_string();
    match status {
        Status::Running => text.green().to_string(),
        Status::Starting | Status::Restarting => text.yellow().to_string(),
        Status::Stopped => text.bright_black().to_string(),
        Status::FailedPermanently => text.red().bold().to_string(),
    }
}

/// Format a duration in human-readable format
fn format_duration(duration: &Duration) -> String {
    let secs = duration.as_secs();

    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        let mins = secs / 60;
        let secs = secs % 60;
        if secs > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}m", mins)
        }
    } else if secs < 86400 {
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        if mins > 0 {
            format!("{}h {}m", hours, mins)
        } else {
            format!("{}h", hours)
        }
    } else {
        let days = secs / 86400;
        let hours = (secs % 86400) / 3600;
        if hours > 0 {
            format!("{}d {}h", days, hours)
        } else {
            format!("{}d", days)
        }
    }
}

/// Format memory usage in human-readable format
fn format_memory(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else if bytes < GB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

fn format_memory_usage(sample: Option<u64>, limit: Option<u64>) -> String {
    match (sample, limit) {
        (Some(sample), Some(limit)) => format!("{} / {}", format_memory(sample), format_memory(limit)),
        (Some(sample), None) => format_memory(sample),
        (None, Some(limit)) => format!("- / {}", format_memory(limit)),
        (None, None) => "-".to_string(),
    }
}

/// Truncate a string to at most `max_len` characters
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Spinner for waiting on the daemon
pub fn create_progress_bar(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::default_spinner()
        .template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
        .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
    pb.set_style(style);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Finish a progress bar with success
pub fn finish_progress_success(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", "✓".green(), message));
}

/// Finish a progress bar with error
pub fn finish_progress_error(pb: ProgressBar, message: &str) {
    pb.finish_with_message(format!("{} {}", "✗".red(), message));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(&Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(&Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(&Duration::from_secs(3700)), "1h 1m");
        assert_eq!(format_duration(&Duration::from_secs(90000)), "1d 1h");
    }

    #[test]
    fn test_format_memory_usage() {
        assert_eq!(format_memory_usage(None, None), "-");
        assert_eq!(format_memory_usage(Some(512), None), "512B");
        assert_eq!(
            format_memory_usage(Some(2 * 1024 * 1024), Some(1024 * 1024 * 1024)),
            "2.0MB / 1.00GB"
        );
        assert_eq!(format_memory_usage(None, Some(2048)), "- / 2.0KB");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a very long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }
}
