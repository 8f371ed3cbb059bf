//! Console report, progress bar and CSV export.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use isoprobe_core::{Exporter, LatencySummary, Progress, Verification, WorkloadOutcome};
use isoprobe_error::Result;
use isoprobe_types::Settings;

/// Milliseconds with two decimals.
fn ms(duration: Duration) -> String {
    format!("{:.2}", duration.as_secs_f64() * 1_000.0)
}

fn section(out: &mut dyn Write, title: &str) -> std::io::Result<()> {
    writeln!(out, "\n--- {title} {}", "-".repeat(40_usize.saturating_sub(title.len())))
}

/// Print the full post-run report.
pub fn print_report(
    out: &mut dyn Write,
    settings: &Settings,
    outcome: &WorkloadOutcome,
    verification: &Verification,
) -> std::io::Result<()> {
    let summary = LatencySummary::from_samples(outcome.samples.clone());

    section(out, "workload")?;
    writeln!(
        out,
        "{:<18} {} ({})",
        "protocol", settings.workload, settings.workload.alias()
    )?;
    writeln!(out, "{:<18} {}", "accounts", settings.accounts)?;
    writeln!(out, "{:<18} {}", "selection", settings.selection)?;
    writeln!(out, "{:<18} {}", "iterations", settings.iterations)?;
    writeln!(out, "{:<18} {}", "workers", settings.effective_workers())?;

    section(out, "totals")?;
    writeln!(out, "{:<18} {}", "commits", outcome.commits)?;
    writeln!(out, "{:<18} {}", "fails", outcome.fails)?;
    writeln!(out, "{:<18} {}", "retries", outcome.retries)?;
    writeln!(out, "{:<18} {:.2}s", "run time", outcome.elapsed.as_secs_f64())?;

    section(out, "timings (ms)")?;
    writeln!(out, "{:<18} {}", "samples", summary.count)?;
    writeln!(out, "{:<18} {}", "avg", ms(summary.avg))?;
    writeln!(out, "{:<18} {}", "cumulative", ms(summary.sum))?;
    writeln!(out, "{:<18} {}", "min", ms(summary.min))?;
    writeln!(out, "{:<18} {}", "max", ms(summary.max))?;
    writeln!(out, "{:<18} {}", "p50", ms(summary.p50))?;
    writeln!(out, "{:<18} {}", "p95", ms(summary.p95))?;
    writeln!(out, "{:<18} {}", "p99", ms(summary.p99))?;
    writeln!(out, "{:<18} {}", "p99.9", ms(summary.p999))?;

    section(out, "safety")?;
    writeln!(out, "{:<18} {}", "isolation", settings.isolation.alias())?;
    writeln!(out, "{:<18} {}", "locking", settings.lock.alias())?;
    writeln!(
        out,
        "{:<18} {}",
        "retries",
        if settings.skip_retry { "off" } else { "on" }
    )?;
    writeln!(
        out,
        "{:<18} {}",
        "jitter",
        if settings.retry_jitter { "on" } else { "off" }
    )?;

    section(out, "outcome")?;
    if verification.clean() {
        writeln!(out, "no anomaly detected")?;
    } else {
        writeln!(out, "{} anomaly observation(s):", verification.anomaly_count)?;
    }
    for detail in &verification.details {
        writeln!(out, "  {detail}")?;
    }
    Ok(())
}

/// In-place ASCII progress bar, rendered to stderr at most every 100ms.
pub struct ProgressBar {
    total: usize,
    width: usize,
    started: Instant,
    last_render: Option<Instant>,
}

impl ProgressBar {
    const THROTTLE: Duration = Duration::from_millis(100);

    #[must_use]
    pub fn new(total: usize) -> Self {
        Self {
            total,
            width: 30,
            started: Instant::now(),
            last_render: None,
        }
    }

    pub fn render(&mut self, progress: &Progress, err: &mut dyn Write) {
        if !self.due(progress.completed) {
            return;
        }
        let line = self.line(progress.completed, progress.rate(), progress.eta());
        let _ = write!(err, "\r{line}");
        let _ = err.flush();
    }

    /// Seeding-style updates where only a running count is known.
    pub fn render_counts(&mut self, completed: usize, err: &mut dyn Write) {
        if !self.due(completed) {
            return;
        }
        let progress = Progress {
            completed,
            total: self.total,
            elapsed: self.started.elapsed(),
        };
        let line = self.line(completed, progress.rate(), progress.eta());
        let _ = write!(err, "\r{line}");
        let _ = err.flush();
    }

    pub fn finish(&mut self, err: &mut dyn Write) {
        if self.last_render.is_some() {
            let _ = writeln!(err);
        }
    }

    fn due(&mut self, completed: usize) -> bool {
        let now = Instant::now();
        let due = completed >= self.total
            || self
                .last_render
                .map_or(true, |last| now.duration_since(last) >= Self::THROTTLE);
        if due {
            self.last_render = Some(now);
        }
        due
    }

    fn line(&self, completed: usize, rate: f64, eta: Duration) -> String {
        let fraction = if self.total == 0 {
            1.0
        } else {
            (completed as f64 / self.total as f64).min(1.0)
        };
        let filled = (fraction * self.width as f64).round() as usize;
        format!(
            "[{}{}] {:>5.1}% {:>8.1}/s ETA {:>4.0}s",
            "#".repeat(filled),
            "-".repeat(self.width - filled),
            fraction * 100.0,
            rate,
            eta.as_secs_f64()
        )
    }
}

/// Writes `name,value,unit` rows, header first.
pub struct CsvExporter {
    writer: BufWriter<File>,
}

impl CsvExporter {
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);
        writeln!(writer, "name,value,unit")?;
        Ok(Self { writer })
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

impl Exporter for CsvExporter {
    fn record(&mut self, name: &str, value: &str, unit: &str) -> Result<()> {
        writeln!(self.writer, "{name},{value},{unit}")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use isoprobe_types::{IsolationLevel, LockType, WorkloadKind};

    #[test]
    fn report_contains_every_section() {
        let settings = Settings {
            workload: WorkloadKind::WriteSkew,
            isolation: IsolationLevel::Serializable,
            lock: LockType::CompareAndSet,
            ..Settings::default()
        };
        let outcome = WorkloadOutcome {
            commits: 10,
            fails: 1,
            retries: 3,
            samples: vec![Duration::from_millis(2); 13],
            elapsed: Duration::from_secs(1),
        };
        let verification = Verification {
            anomaly_count: 2,
            details: vec!["account 7 aggregate balance is -3.00".to_owned()],
        };

        let mut out = Vec::new();
        print_report(&mut out, &settings, &outcome, &verification).expect("write");
        let text = String::from_utf8(out).expect("utf8");
        for needle in [
            "workload",
            "write_skew (A5B)",
            "totals",
            "timings",
            "safety",
            "1SR",
            "CAS",
            "outcome",
            "2 anomaly observation(s)",
            "account 7",
        ] {
            assert!(text.contains(needle), "missing '{needle}' in:\n{text}");
        }
    }

    #[test]
    fn clean_report_says_so() {
        let mut out = Vec::new();
        print_report(
            &mut out,
            &Settings::default(),
            &WorkloadOutcome::default(),
            &Verification::default(),
        )
        .expect("write");
        assert!(String::from_utf8(out)
            .expect("utf8")
            .contains("no anomaly detected"));
    }

    #[test]
    fn progress_bar_renders_and_finishes() {
        let mut bar = ProgressBar::new(100);
        let mut err = Vec::new();
        bar.render(
            &Progress {
                completed: 100,
                total: 100,
                elapsed: Duration::from_secs(2),
            },
            &mut err,
        );
        bar.finish(&mut err);
        let text = String::from_utf8(err).expect("utf8");
        assert!(text.contains("100.0%"));
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn csv_export_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("report.csv");
        let mut exporter = CsvExporter::create(&path).expect("create");
        exporter.record("commits", "42", "txns").expect("record");
        exporter.record("lost_amount", "0.00", "USD").expect("record");
        exporter.finish().expect("flush");

        let text = std::fs::read_to_string(&path).expect("read back");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "name,value,unit");
        assert_eq!(lines[1], "commits,42,txns");
        assert_eq!(lines[2], "lost_amount,0.00,USD");
    }
}
