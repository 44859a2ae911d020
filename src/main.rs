// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Link-quality sessions against the downstream ports of a PCIe switch.

use anyhow::{bail, Context};
use clap::ArgEnum;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use linkqa::assessment::{SessionProgress, Verdict};
use linkqa::counters::{ProcessCommandChannel, SwitchCommandChannel};
use linkqa::kernel_log::DmesgLogQuery;
use linkqa::register::{RegisterAccess, TimedRegisterAccess, DEFAULT_REGISTER_TIMEOUT};
use linkqa::retrain::{ResetMethod, SysfsSlotControl};
use linkqa::topology::{DeviceSignature, PciDeviceInfo};
use linkqa::{Bdf, Collaborators, QualitySession, SessionConfig};

#[derive(Copy, Clone, Debug, PartialEq, Eq, ArgEnum)]
enum Method {
    Retrain,
    Flr,
    SurpriseRemoval,
    PowerCycle,
}

impl From<Method> for ResetMethod {
    fn from(m: Method) -> Self {
        match m {
            Method::Retrain => ResetMethod::LinkRetrain,
            Method::Flr => ResetMethod::FunctionLevelReset,
            Method::SurpriseRemoval => ResetMethod::SurpriseRemoval,
            Method::PowerCycle => ResetMethod::PowerCycle,
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
/// The `linkqa` program exercises the links below a PCIe switch and grades
/// how well they hold up.
///
/// Endpoints behind a recognized switch are repeatedly retrained or reset
/// while their LTSSM state and the switch's error counters are sampled in
/// the background. At the end, events are correlated in time and the
/// session is scored against PCIe 6.x timing and error limits. Nothing
/// outside the switch's bus ranges is ever reset.
struct Args {
    /// JSON session configuration; command-line options override it.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Session length, in seconds.
    #[clap(short, long)]
    duration: Option<u64>,

    /// Test this device. May be repeated; the default is every endpoint
    /// found below the switch.
    #[clap(short, long = "target")]
    targets: Vec<Bdf>,

    /// Maximum number of endpoints to test.
    #[clap(long)]
    max_targets: Option<usize>,

    /// Reset methods to draw from. May be repeated.
    #[clap(short, long = "method", arg_enum)]
    methods: Vec<Method>,

    /// Stop after this many resets.
    #[clap(short, long)]
    resets: Option<u32>,

    /// Time between resets, in seconds.
    #[clap(long, parse(try_from_str = parse_interval))]
    reset_interval: Option<Duration>,

    /// Switch vendor:device signature, e.g. `1000:c030`. May be repeated.
    #[clap(short, long = "switch")]
    switches: Vec<DeviceSignature>,

    /// Vendor CLI used to read the switch error counters. Without it,
    /// error counters are not sampled.
    #[clap(long)]
    switch_cli: Option<String>,

    /// Output file name for the JSON report.
    ///
    /// Default is a name based on the timestamp, to avoid clobbering past
    /// results.
    #[clap(short, long)]
    output: Option<String>,

    /// Print the devices in scope and exit without resetting anything.
    #[clap(long)]
    scope_only: bool,

    /// Print verbose information about the session.
    #[clap(short, long, parse(from_occurrences))]
    verbose: u64,
}

/// Parse a positive number of seconds, with millisecond resolution.
fn parse_interval(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|e| format!("{e}"))?;
    if !secs.is_finite() || secs <= 0.0 {
        return Err(format!("expected a positive number of seconds, got {s}"));
    }
    let interval = Duration::try_from_secs_f64(secs).map_err(|e| format!("{e}"))?;
    if interval < Duration::from_millis(1) {
        return Err(format!("{s}s is shorter than a millisecond"));
    }
    if u64::try_from(interval.as_millis()).is_err() {
        return Err(format!("{s}s is too long"));
    }
    Ok(interval)
}

fn init_logging(verbose: u64) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = match &args.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config \"{}\"", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(secs) = args.duration {
        config.duration_secs = secs;
    }
    if !args.targets.is_empty() {
        config.targets = args.targets.clone();
    }
    if let Some(n) = args.max_targets {
        config.max_targets = n;
    }
    if !args.methods.is_empty() {
        config.methods = args.methods.iter().map(|&m| m.into()).collect();
    }
    if args.resets.is_some() {
        config.reset_count = args.resets;
    }
    if let Some(interval) = args.reset_interval {
        config.reset_interval_ms = u64::try_from(interval.as_millis())?;
    }
    if !args.switches.is_empty() {
        config.switch_signatures = args.switches.clone();
    }
    config.validate()?;
    Ok(config)
}

#[cfg(target_os = "illumos")]
fn open_registers() -> anyhow::Result<TimedRegisterAccess> {
    let backend = linkqa::register::PcitoolConfigSpace::open()?;
    Ok(TimedRegisterAccess::new(backend, DEFAULT_REGISTER_TIMEOUT)?)
}

#[cfg(not(target_os = "illumos"))]
fn open_registers() -> anyhow::Result<TimedRegisterAccess> {
    let backend = linkqa::register::SysfsConfigSpace::new();
    Ok(TimedRegisterAccess::new(backend, DEFAULT_REGISTER_TIMEOUT)?)
}

fn device_table(sysfs_root: &Path, registers: &dyn RegisterAccess) -> anyhow::Result<Vec<PciDeviceInfo>> {
    if sysfs_root.is_dir() {
        linkqa::topology::discover_sysfs(sysfs_root)
            .with_context(|| format!("Failed to list devices under \"{}\"", sysfs_root.display()))
    } else {
        Ok(linkqa::topology::scan_config_space(registers, 0))
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = build_config(&args)?;
    if args.verbose > 1 {
        println!("{:#?}", config);
    }

    let registers: Arc<dyn RegisterAccess> =
        Arc::new(open_registers().context("Failed to open configuration space")?);
    let devices = device_table(&config.sysfs_root, registers.as_ref())?;
    let switch = args.switch_cli.as_deref().map(|program| {
        Arc::new(ProcessCommandChannel::new(program, &[]).with_timeout(Duration::from_secs(5)))
            as Arc<dyn SwitchCommandChannel>
    });
    let collaborators = Collaborators {
        registers,
        logs: Arc::new(DmesgLogQuery::new()),
        switch,
        slots: Some(Arc::new(SysfsSlotControl::new())),
    };
    let session = QualitySession::new(config, collaborators);

    if args.scope_only {
        let selection = session.select_targets(&devices)?;
        for port in &selection.scope.ports {
            println!(
                "switch port {}: buses {:02x}-{:02x}",
                port.bdf, port.secondary, port.subordinate
            );
        }
        for target in &selection.targets {
            println!(
                "target {} [{:04x}:{:04x}] upstream {}",
                target.bdf,
                target.vendor_id,
                target.device_id,
                target
                    .upstream
                    .map_or_else(|| "-".to_string(), |u| u.to_string()),
            );
        }
        for skipped in &selection.skipped {
            println!("skipped {skipped}");
        }
        return Ok(());
    }

    let filename = args.output.clone().unwrap_or_else(|| {
        format!(
            "linkqa-report-{}.json",
            chrono::Utc::now().format("%Y-%m-%dT%H-%M-%S"),
        )
    });
    let outfile = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&filename)
        .with_context(|| format!("Failed to create output file \"{filename}\""))?;
    if args.verbose > 0 {
        println!("Writing report to: \"{}\"", filename);
    }

    let total = session.config().duration();
    let bar = ProgressBar::new(total.as_secs().max(1));
    bar.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {wide_bar} {pos}/{len}s {msg}")?,
    );
    let report = session.run_with_progress(&devices, |p: &SessionProgress| {
        bar.set_position(p.elapsed.as_secs());
        bar.set_message(format!("{} resets, {} snapshots", p.resets, p.snapshots));
    });
    bar.finish_and_clear();
    let report = report?;

    write_report(outfile, &report)?;

    let assessment = &report.assessment;
    println!(
        "Grade {}/25 ({:.1}): {}",
        assessment.grade, assessment.overall_score, assessment.verdict
    );
    if let Some(rate) = assessment.success_rate {
        println!("Reset success rate: {rate:.1}% over {} resets", report.operations.len());
    }
    for violation in &assessment.violations {
        println!(
            "  [{}] {}: limit {}, observed {}",
            violation.severity, violation.requirement, violation.limit, violation.observed
        );
    }
    if args.verbose > 0 {
        for warning in &report.warnings {
            println!("warning: {warning}");
        }
    }
    for error in &report.errors {
        println!("error: {error}");
    }

    if report.verdict() == Verdict::Fail {
        bail!("Link quality grade {} is below the pass threshold", assessment.grade);
    }
    Ok(())
}

fn write_report(file: File, report: &linkqa::QualityReport) -> anyhow::Result<()> {
    serde_json::to_writer_pretty(std::io::BufWriter::new(file), report)
        .context("Failed to write report")
}
