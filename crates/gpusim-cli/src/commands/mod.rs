//! CLI commands implementation

use anyhow::Result;
use gpusim_core::{JobRecord, SchedulePolicy, SimConfig};
use gpusim_scheduler::{JobSource, JobTraceReader, Simulation, SimulationReport};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Command-line values that take precedence over the config file
#[derive(Debug, Default)]
pub struct Overrides {
    pub schedule: Option<String>,
    pub trace_file: Option<PathBuf>,
    pub ticks: Option<u64>,
    pub seed: Option<u64>,
}

impl Overrides {
    /// Apply the overrides and re-validate the result
    pub fn apply(self, config: &mut SimConfig) -> Result<()> {
        if let Some(schedule) = self.schedule {
            config.schedule = schedule.parse::<SchedulePolicy>()?;
        }
        if let Some(path) = self.trace_file {
            config.trace_file = Some(path);
        }
        if let Some(ticks) = self.ticks {
            config.simulation.max_ticks = ticks;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        config.validate()?;
        Ok(())
    }
}

/// Run a simulation and print its report
pub fn run(config: &SimConfig, json: bool) -> Result<()> {
    let mut simulation = Simulation::from_config(config)?;
    let report = simulation.run()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &SimulationReport) {
    let mode = if report.replay { "replay" } else { "generated" };
    println!("Simulation report ({})", report.generated_at.to_rfc3339());
    println!("  Schedule: {} ({} workload)", report.schedule, mode);
    println!("  Ticks: {}", report.ticks);
    println!();
    println!(
        "{:<12} {:<12} {:<12} {:<12} {:<12}",
        "SUBMITTED", "FINISHED", "RUNNING", "QUEUED", "PREEMPTED"
    );
    println!("{}", "-".repeat(60));
    println!(
        "{:<12} {:<12} {:<12} {:<12} {:<12}",
        report.jobs_submitted,
        report.jobs_finished,
        report.jobs_running,
        report.jobs_queued,
        report.preemptions
    );
    println!();
    println!("  Avg pending time: {:.2} ticks", report.avg_pending_time);
    println!("  Avg completion time: {:.2} ticks", report.avg_completion_time);
    println!(
        "  GPU utilization: {:.1}% mean, {:.1}% peak",
        report.mean_gpu_utilization * 100.0,
        report.peak_gpu_utilization * 100.0
    );
}

/// Aggregate view of a workload trace
#[derive(Debug, PartialEq)]
pub struct TraceSummary {
    pub jobs: usize,
    pub first_submit: f64,
    pub last_submit: f64,
    pub total_minutes: f64,
    /// Job count per requested GPU count
    pub gpu_histogram: BTreeMap<u32, usize>,
}

/// Load a trace and aggregate it
pub fn summarize_trace(path: &Path) -> Result<TraceSummary> {
    let mut reader = JobTraceReader::new(path);
    reader.prepare_jobs()?;
    let records: Vec<JobRecord> = reader.generate_jobs(u64::MAX)?;

    let mut gpu_histogram = BTreeMap::new();
    for record in &records {
        *gpu_histogram.entry(record.used_gpus).or_insert(0) += 1;
    }

    Ok(TraceSummary {
        jobs: records.len(),
        first_submit: records.first().map_or(0.0, |r| r.normalized_time),
        last_submit: records.last().map_or(0.0, |r| r.normalized_time),
        total_minutes: records.iter().map(|r| r.minutes).sum(),
        gpu_histogram,
    })
}

/// Summarize a workload trace
pub fn trace(path: &Path) -> Result<()> {
    let summary = summarize_trace(path)?;

    if summary.jobs == 0 {
        println!("No jobs found in {}", path.display());
        return Ok(());
    }

    println!("Trace: {}", path.display());
    println!("  Jobs: {}", summary.jobs);
    println!(
        "  Submit window: {} - {}",
        summary.first_submit, summary.last_submit
    );
    println!("  Total work: {:.1} minutes", summary.total_minutes);
    println!();
    println!("{:<8} {:<8}", "GPUS", "JOBS");
    println!("{}", "-".repeat(16));
    for (gpus, jobs) in &summary.gpu_histogram {
        println!("{:<8} {:<8}", gpus, jobs);
    }
    Ok(())
}

/// Print the effective configuration as TOML
pub fn show_config(config: &SimConfig) -> Result<()> {
    print!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_overrides_take_precedence() {
        let mut config = SimConfig::default();
        let overrides = Overrides {
            schedule: Some("horus".to_string()),
            trace_file: Some(PathBuf::from("trace.csv")),
            ticks: Some(10),
            seed: Some(3),
        };
        overrides.apply(&mut config).unwrap();

        assert_eq!(config.schedule, SchedulePolicy::Horus);
        assert_eq!(config.trace_file, Some(PathBuf::from("trace.csv")));
        assert_eq!(config.simulation.max_ticks, 10);
        assert_eq!(config.seed, 3);
    }

    #[test]
    fn test_unknown_schedule_override_is_rejected() {
        let mut config = SimConfig::default();
        let overrides = Overrides {
            schedule: Some("round-robin".to_string()),
            ..Overrides::default()
        };
        assert!(overrides.apply(&mut config).is_err());
        assert_eq!(config.schedule, SchedulePolicy::Fifo);
    }

    #[test]
    fn test_summarize_trace() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "minutes,normalized_time,gpu_per_container,gpu_utilization_avg,\
             gpu_utilization_max,memory_avg,memory_max,used_gpus"
        )
        .unwrap();
        writeln!(file, "10,4,1,0.5,0.9,1,1,2").unwrap();
        writeln!(file, "5,1,1,0.5,0.9,1,1,1").unwrap();
        writeln!(file, "20,9,1,0.5,0.9,1,1,2").unwrap();

        let summary = summarize_trace(file.path()).unwrap();
        assert_eq!(summary.jobs, 3);
        assert_eq!(summary.first_submit, 1.0);
        assert_eq!(summary.last_submit, 9.0);
        assert_eq!(summary.total_minutes, 35.0);
        assert_eq!(summary.gpu_histogram[&2], 2);
        assert_eq!(summary.gpu_histogram[&1], 1);
    }

    #[test]
    fn test_default_config_renders_as_toml() {
        let rendered = toml::to_string_pretty(&SimConfig::default()).unwrap();
        assert!(rendered.contains("schedule = \"fifo\""));
        let parsed = SimConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed.seed, 42);
    }
}
