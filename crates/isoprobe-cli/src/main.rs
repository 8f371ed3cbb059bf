//! `isoprobe` binary: seed the in-memory ledger, run one anomaly
//! workload against it, print the report.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use isoprobe_core::{instantiate, IterationScheduler, NullExporter, Workload};
use isoprobe_error::{ProbeError, Result};
use isoprobe_store::{AccountStore, MemStore, MemStoreConfig};
use isoprobe_types::{SelectionMode, Settings, WorkloadKind, INITIAL_BALANCE};
use tracing::warn;

mod report;

use report::{CsvExporter, ProgressBar};

fn main() {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = run(&args, &mut std::io::stdout(), &mut std::io::stderr());
    std::process::exit(code);
}

const USAGE: &str = "\
usage: isoprobe <workload> [options]

workloads:
";

const OPTIONS: &str = "\
options:
  --isolation <rc|rr|1sr>    isolation level (default 1sr)
  --locking <na|fs|fu|cas>   row locking / CAS strategy (default na)
  --sfu                      shorthand for --locking fu
  --cas                      shorthand for --locking cas
  --accounts <n>             account tuples to seed (default 50000)
  --selection <n>            working sample size in rows (default 500)
  --sequential               pick the sample in key order, not randomly
  --contention <n>           legs touched per lost-update iteration (default 8)
  --iterations <n>           iterations to run (default 1000)
  --threads <n>              worker threads (default 2x logical CPUs)
  --ratio <0..1>             read fraction for P2/P3 (default 0.9)
  --max-retries <n>          transient retry budget, 1..=30 (default 15)
  --retry-cap <ms>           backoff ceiling in milliseconds (default 15000)
  --jitter                   add up to 1s of random backoff jitter
  --skip-retry               run every transaction exactly once
  --latency <ms>             injected per-statement store latency (default 0)
  --export <file>            write the report as name,value,unit CSV rows
  --seed                     seed the ledger and exit without running
  --help                     print this help
";

struct Cli {
    settings: Settings,
    export: Option<PathBuf>,
    latency: Duration,
    seed_only: bool,
}

fn usage() -> String {
    let mut text = String::from(USAGE);
    for kind in WorkloadKind::ALL {
        text.push_str(&format!("  {:<20} {}\n", kind.name(), kind.note()));
    }
    text.push('\n');
    text.push_str(OPTIONS);
    text
}

fn parse_args(args: &[String]) -> Result<Option<Cli>> {
    let mut settings = Settings::default();
    let mut export = None;
    let mut latency = Duration::ZERO;
    let mut seed_only = false;
    let mut workload = None;

    fn value<'a>(iter: &mut std::slice::Iter<'a, String>, flag: &str) -> Result<&'a str> {
        iter.next()
            .map(String::as_str)
            .ok_or_else(|| ProbeError::settings(format!("{flag} needs a value")))
    }

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(None),
            "--isolation" => settings.isolation = value(&mut iter, "--isolation")?.parse()?,
            "--locking" => settings.lock = value(&mut iter, "--locking")?.parse()?,
            "--sfu" => settings.lock = "fu".parse()?,
            "--cas" => settings.lock = "cas".parse()?,
            "--accounts" => settings.accounts = parse_number(value(&mut iter, "--accounts")?)?,
            "--selection" => settings.selection = parse_number(value(&mut iter, "--selection")?)?,
            "--sequential" => settings.selection_mode = SelectionMode::Sequential,
            "--contention" => {
                settings.contention_level = parse_number(value(&mut iter, "--contention")?)?;
            }
            "--iterations" => {
                settings.iterations = parse_number(value(&mut iter, "--iterations")?)?;
            }
            "--threads" => settings.workers = parse_number(value(&mut iter, "--threads")?)?,
            "--ratio" => {
                let raw = value(&mut iter, "--ratio")?;
                settings.read_write_ratio = raw
                    .parse()
                    .map_err(|_| ProbeError::settings(format!("bad ratio '{raw}'")))?;
            }
            "--max-retries" => {
                settings.max_retries = parse_number::<u32>(value(&mut iter, "--max-retries")?)?;
            }
            "--retry-cap" => {
                settings.backoff_cap_ms = parse_number(value(&mut iter, "--retry-cap")?)?;
            }
            "--jitter" => settings.retry_jitter = true,
            "--skip-retry" => settings.skip_retry = true,
            "--latency" => {
                latency = Duration::from_millis(parse_number(value(&mut iter, "--latency")?)?);
            }
            "--export" => export = Some(PathBuf::from(value(&mut iter, "--export")?)),
            "--seed" => seed_only = true,
            other if other.starts_with('-') => {
                return Err(ProbeError::settings(format!("unknown option '{other}'")));
            }
            name => {
                if workload.replace(name.parse::<WorkloadKind>()?).is_some() {
                    return Err(ProbeError::settings("more than one workload given"));
                }
            }
        }
    }

    match workload {
        Some(kind) => settings.workload = kind,
        None if seed_only => {}
        None => return Err(ProbeError::settings("no workload given")),
    }
    settings.validate()?;
    Ok(Some(Cli {
        settings,
        export,
        latency,
        seed_only,
    }))
}

fn parse_number<T: std::str::FromStr>(raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| ProbeError::settings(format!("bad number '{raw}'")))
}

fn run(args: &[String], out: &mut dyn Write, err: &mut dyn Write) -> i32 {
    let cli = match parse_args(args) {
        Ok(Some(cli)) => cli,
        Ok(None) => {
            let _ = write!(out, "{}", usage());
            return 0;
        }
        Err(parse_err) => {
            let _ = writeln!(err, "isoprobe: {parse_err}");
            let _ = write!(err, "{}", usage());
            return 2;
        }
    };
    match execute(cli, out, err) {
        Ok(()) => 0,
        Err(run_err) => {
            let _ = writeln!(err, "isoprobe: {run_err}");
            1
        }
    }
}

fn execute(mut cli: Cli, out: &mut dyn Write, err: &mut dyn Write) -> Result<()> {
    if cli.settings.clamp_selection() {
        warn!(
            selection = cli.settings.selection,
            "selection clamped to the seeded account count"
        );
    }

    let store: Arc<dyn AccountStore> = Arc::new(MemStore::with_config(MemStoreConfig {
        latency: cli.latency,
        ..MemStoreConfig::default()
    }));

    let mut seed_bar = ProgressBar::new(cli.settings.accounts);
    let mut seeded = 0_usize;
    store.create_accounts(cli.settings.accounts, INITIAL_BALANCE, &mut |added| {
        seeded += added;
        seed_bar.render_counts(seeded, err);
    })?;
    seed_bar.finish(err);
    writeln!(
        out,
        "seeded {} account tuples at {} each",
        cli.settings.accounts, INITIAL_BALANCE
    )?;
    if cli.seed_only {
        return Ok(());
    }

    let mut workload = instantiate(cli.settings.clone(), Arc::clone(&store));
    workload.validate_settings()?;
    workload.before_all()?;
    let workload: Arc<dyn Workload> = Arc::from(workload);

    let scheduler = IterationScheduler::new(cli.settings.effective_workers());
    let mut run_bar = ProgressBar::new(cli.settings.iterations);
    let outcome = scheduler.run(&workload, cli.settings.iterations, &mut |progress| {
        run_bar.render(progress, err);
    });
    run_bar.finish(err);

    let verification = match cli.export.take() {
        Some(path) => {
            let mut exporter = CsvExporter::create(&path)?;
            let verification = workload.after_all(&mut exporter)?;
            exporter.finish()?;
            writeln!(out, "report rows exported to {}", path.display())?;
            verification
        }
        None => workload.after_all(&mut NullExporter)?,
    };

    report::print_report(out, &cli.settings, &outcome, &verification)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use isoprobe_types::{IsolationLevel, LockType};

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| (*s).to_owned()).collect()
    }

    fn parse(raw: &[&str]) -> Cli {
        parse_args(&args(raw))
            .expect("parse succeeds")
            .expect("not a help request")
    }

    #[test]
    fn parses_workload_and_strategy() {
        let cli = parse(&[
            "lost_update",
            "--isolation",
            "rc",
            "--cas",
            "--iterations",
            "50",
        ]);
        assert_eq!(cli.settings.workload, WorkloadKind::LostUpdate);
        assert_eq!(cli.settings.isolation, IsolationLevel::ReadCommitted);
        assert_eq!(cli.settings.lock, LockType::CompareAndSet);
        assert_eq!(cli.settings.iterations, 50);
    }

    #[test]
    fn accepts_anomaly_aliases() {
        let cli = parse(&["A5B"]);
        assert_eq!(cli.settings.workload, WorkloadKind::WriteSkew);
    }

    #[test]
    fn sfu_shorthand_sets_for_update() {
        let cli = parse(&["p4", "--sfu"]);
        assert_eq!(cli.settings.lock, LockType::ForUpdate);
    }

    #[test]
    fn rejects_missing_workload() {
        assert!(parse_args(&args(&["--iterations", "5"])).is_err());
    }

    #[test]
    fn seed_needs_no_workload() {
        let cli = parse_args(&args(&["--seed", "--accounts", "100"]))
            .expect("parse succeeds")
            .expect("not help");
        assert!(cli.seed_only);
        assert_eq!(cli.settings.accounts, 100);
    }

    #[test]
    fn rejects_unknown_flag_and_bad_values() {
        assert!(parse_args(&args(&["p4", "--bogus"])).is_err());
        assert!(parse_args(&args(&["p4", "--iterations", "many"])).is_err());
        assert!(parse_args(&args(&["p4", "--isolation"])).is_err());
        assert!(parse_args(&args(&["nonsense_workload"])).is_err());
    }

    #[test]
    fn validation_runs_at_parse_time() {
        // Odd contention level must be rejected before anything starts.
        assert!(parse_args(&args(&["p4", "--contention", "7"])).is_err());
    }

    #[test]
    fn help_short_circuits() {
        assert!(parse_args(&args(&["--help"])).expect("ok").is_none());
        assert!(parse_args(&args(&["p4", "-h"])).expect("ok").is_none());
    }

    #[test]
    fn run_prints_usage_on_help() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run(&args(&["--help"]), &mut out, &mut err);
        assert_eq!(code, 0);
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("usage: isoprobe"));
        assert!(text.contains("lost_update"));
        assert!(text.contains("--latency"));
    }

    #[test]
    fn run_reports_parse_errors_on_stderr() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run(&args(&[]), &mut out, &mut err);
        assert_eq!(code, 2);
        assert!(String::from_utf8(err).expect("utf8").contains("no workload"));
    }

    #[test]
    fn small_end_to_end_run() {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let code = run(
            &args(&[
                "lost_update",
                "--isolation",
                "1sr",
                "--cas",
                "--accounts",
                "50",
                "--selection",
                "20",
                "--contention",
                "2",
                "--iterations",
                "10",
                "--threads",
                "1",
            ]),
            &mut out,
            &mut err,
        );
        assert_eq!(code, 0, "stderr: {}", String::from_utf8_lossy(&err));
        let text = String::from_utf8(out).expect("utf8");
        assert!(text.contains("seeded 50 account tuples"));
        assert!(text.contains("commits"));
        assert!(text.contains("no anomaly detected"));
    }
}
