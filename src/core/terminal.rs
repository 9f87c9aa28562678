use console::{Emoji, style};

use crate::core::pipeline::{SegmentOutcome, TaskReport};

pub static SUCCESS_ICON: Emoji<'_, '_> = Emoji("✅ ", "");
pub static INFO_ICON: Emoji<'_, '_> = Emoji("ℹ️  ", "");
pub static WARN_ICON: Emoji<'_, '_> = Emoji("⚠️  ", "");
pub static ERROR_ICON: Emoji<'_, '_> = Emoji("❌ ", "");
pub static CLAPPER: Emoji<'_, '_> = Emoji("🎬 ", "");
pub static GEAR: Emoji<'_, '_> = Emoji("⚙️  ", "");

pub fn print_success(msg: &str) {
    println!("{} {}", SUCCESS_ICON, style(msg).green());
}

pub fn print_info(msg: &str) {
    println!("{} {}", INFO_ICON, style(msg).blue());
}

pub fn print_warn(msg: &str) {
    println!("{} {}", WARN_ICON, style(msg).yellow());
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}", ERROR_ICON, style(msg).red().bold());
}

pub fn print_step(step: &str) {
    println!("{} {}", CLAPPER, style(step).bold());
}

pub fn print_banner() {
    println!();
    println!(
        "{}",
        style(" clipforge ").bold().black().on_cyan()
    );
    println!("{}\n", style("Scripted video, one verified shot at a time.").cyan());
}

/// A titled block of aligned rows, printed to stdout.
pub struct GuideSection {
    title: String,
    rows: Vec<String>,
}

impl GuideSection {
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            rows: Vec::new(),
        }
    }

    pub fn command(mut self, name: &str, about: &str) -> Self {
        self.rows
            .push(format!("  {:<10} {}", style(name).green(), about));
        self
    }

    pub fn status(mut self, label: &str, value: &str) -> Self {
        self.rows.push(format!(
            "  {} {}: {}",
            GEAR,
            style(label).bold().cyan(),
            value
        ));
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.rows.extend(text.lines().map(|l| format!("  {l}")));
        self
    }

    pub fn blank(mut self) -> Self {
        self.rows.push(String::new());
        self
    }

    pub fn print(self) {
        println!("{}", style(&self.title).bold().underlined());
        for row in self.rows {
            println!("{row}");
        }
        println!();
    }
}

pub fn print_report(report: &TaskReport) {
    let mut section = GuideSection::new(&format!("Task {}", report.task_id))
        .status("State", report.state.as_str());
    if let Some(revision) = report.plan_revision {
        section = section.status(
            "Plan",
            &format!("revision {} ({} replans)", revision, report.replans),
        );
    }
    for seg in &report.segments {
        let outcome = match seg.outcome {
            SegmentOutcome::Accepted => style(seg.outcome.as_str()).green(),
            SegmentOutcome::Pending | SegmentOutcome::NeverAttempted => {
                style(seg.outcome.as_str()).dim()
            }
            SegmentOutcome::ExhaustedRetries | SegmentOutcome::Failed => {
                style(seg.outcome.as_str()).red()
            }
        };
        let mut line = format!("{} after {} attempts", outcome, seg.attempts);
        if let Some(detail) = &seg.detail {
            line.push_str(&format!(" ({detail})"));
        }
        section = section.status(&format!("Segment {}", seg.ordinal), &line);
    }
    section.print();

    if let Some(video) = &report.final_video {
        print_success(&format!("Rendered {} ({:.1}s)", video.uri, video.duration_secs));
    }
    if !report.blocking.is_empty() {
        print_warn(&format!("Blocked by segments {:?}", report.blocking));
    }
    if let Some(error) = &report.error {
        print_error(error);
    }
}
