//! Workload sources: trace replay and synthetic generation

use gpusim_core::{GeneratorConfig, JobRecord, SimError, SimResult};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Supplier of job records for the jobs manager
pub trait JobSource {
    /// Load whatever the source needs ahead of time
    fn prepare_jobs(&mut self) -> SimResult<()> {
        Ok(())
    }

    /// Records that arrive at or before `now`
    fn generate_jobs(&mut self, now: u64) -> SimResult<Vec<JobRecord>>;

    /// Records not handed out yet; `None` when the source is unbounded
    fn remaining_jobs(&self) -> Option<usize>;

    /// Whether this source replays a fixed trace
    fn is_replay(&self) -> bool;
}

/// Replays a CSV workload trace in submit-time order
#[derive(Debug)]
pub struct JobTraceReader {
    path: Option<PathBuf>,
    records: Vec<JobRecord>,
    cursor: usize,
    prepared: bool,
}

impl JobTraceReader {
    /// Create a reader for the trace at `path`; call `prepare_jobs` before use
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: Some(path.as_ref().to_path_buf()),
            records: Vec::new(),
            cursor: 0,
            prepared: false,
        }
    }

    /// Create a reader over records already in memory
    pub fn from_records(mut records: Vec<JobRecord>) -> Self {
        records.sort_by(|a, b| a.normalized_time.total_cmp(&b.normalized_time));
        Self {
            path: None,
            records,
            cursor: 0,
            prepared: true,
        }
    }
}

impl JobSource for JobTraceReader {
    fn prepare_jobs(&mut self) -> SimResult<()> {
        if self.prepared {
            return Ok(());
        }
        let Some(path) = &self.path else {
            return Err(SimError::Trace("trace reader has no file".to_string()));
        };

        let mut reader = csv::Reader::from_path(path)?;
        let mut records = Vec::new();
        for (row, result) in reader.deserialize::<JobRecord>().enumerate() {
            let record = result?;
            if record.minutes < 0.0 || record.normalized_time < 0.0 {
                return Err(SimError::Trace(format!(
                    "row {} has a negative duration or submit time",
                    row + 1
                )));
            }
            records.push(record);
        }
        records.sort_by(|a, b| a.normalized_time.total_cmp(&b.normalized_time));

        info!(path = %path.display(), jobs = records.len(), "Loaded workload trace");
        self.records = records;
        self.cursor = 0;
        self.prepared = true;
        Ok(())
    }

    fn generate_jobs(&mut self, now: u64) -> SimResult<Vec<JobRecord>> {
        if !self.prepared {
            return Err(SimError::Trace("trace requested before prepare_jobs".to_string()));
        }
        let end = self.cursor
            + self.records[self.cursor..].partition_point(|r| r.normalized_time <= now as f64);
        let batch = self.records[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(batch)
    }

    fn remaining_jobs(&self) -> Option<usize> {
        Some(self.records.len() - self.cursor)
    }

    fn is_replay(&self) -> bool {
        true
    }
}

/// Samples synthetic jobs on demand
#[derive(Debug)]
pub struct JobGenerator {
    config: GeneratorConfig,
    rng: StdRng,
}

impl JobGenerator {
    /// Create a deterministic generator
    pub fn new(config: GeneratorConfig, seed: u64) -> Self {
        Self {
            config,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    fn sample(&mut self, now: u64) -> JobRecord {
        let cfg = &self.config;
        let utilization_avg = self.rng.random_range(0.05..=0.95);
        let memory_avg = self.rng.random_range(1.0..=8.0) * BYTES_PER_GIB;
        JobRecord {
            minutes: self.rng.random_range(cfg.min_minutes..=cfg.max_minutes),
            normalized_time: now as f64,
            gpu_per_container: 1.0,
            gpu_utilization_avg: utilization_avg,
            gpu_utilization_max: self.rng.random_range(utilization_avg..=1.0),
            memory_avg,
            memory_max: memory_avg * self.rng.random_range(1.0..=1.5),
            used_gpus: self.rng.random_range(1..=cfg.max_gpus_per_job.max(1)),
        }
    }
}

impl JobSource for JobGenerator {
    fn generate_jobs(&mut self, now: u64) -> SimResult<Vec<JobRecord>> {
        if self.config.max_jobs_per_tick == 0
            || self.rng.random::<f64>() >= self.config.arrival_probability
        {
            return Ok(Vec::new());
        }
        let count = self.rng.random_range(1..=self.config.max_jobs_per_tick);
        let batch: Vec<JobRecord> = (0..count).map(|_| self.sample(now)).collect();
        debug!(now, jobs = batch.len(), "Sampled synthetic jobs");
        Ok(batch)
    }

    fn remaining_jobs(&self) -> Option<usize> {
        None
    }

    fn is_replay(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HEADER: &str = "minutes,normalized_time,gpu_per_container,gpu_utilization_avg,\
                          gpu_utilization_max,memory_avg,memory_max,used_gpus";

    fn write_trace(rows: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", HEADER).unwrap();
        for row in rows {
            writeln!(file, "{}", row).unwrap();
        }
        file
    }

    #[test]
    fn test_trace_reader_replays_in_submit_order() {
        let file = write_trace(&[
            "30,5,1,0.5,0.9,1048576,2097152,2",
            "10,0,1,0.2,0.4,1048576,1048576,1",
            "20,2,1,0.3,0.6,1048576,1048576,4",
        ]);
        let mut reader = JobTraceReader::new(file.path());
        reader.prepare_jobs().unwrap();
        assert_eq!(reader.remaining_jobs(), Some(3));

        let first = reader.generate_jobs(0).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].minutes, 10.0);

        assert!(reader.generate_jobs(1).unwrap().is_empty());

        let rest = reader.generate_jobs(5).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].used_gpus, 4);
        assert_eq!(rest[1].used_gpus, 2);
        assert_eq!(reader.remaining_jobs(), Some(0));
        assert!(reader.is_replay());
    }

    #[test]
    fn test_trace_reader_requires_prepare() {
        let file = write_trace(&["10,0,1,0.2,0.4,1,1,1"]);
        let mut reader = JobTraceReader::new(file.path());
        assert!(matches!(reader.generate_jobs(0), Err(SimError::Trace(_))));
    }

    #[test]
    fn test_trace_reader_rejects_negative_rows() {
        let file = write_trace(&["-1,0,1,0.2,0.4,1,1,1"]);
        let mut reader = JobTraceReader::new(file.path());
        assert!(matches!(reader.prepare_jobs(), Err(SimError::Trace(_))));
    }

    #[test]
    fn test_trace_reader_rejects_malformed_rows() {
        let file = write_trace(&["ten,0,1,0.2,0.4,1,1,1"]);
        let mut reader = JobTraceReader::new(file.path());
        assert!(matches!(reader.prepare_jobs(), Err(SimError::Csv(_))));
    }

    #[test]
    fn test_generator_is_deterministic_per_seed() {
        let config = GeneratorConfig {
            arrival_probability: 1.0,
            ..GeneratorConfig::default()
        };
        let mut a = JobGenerator::new(config.clone(), 9);
        let mut b = JobGenerator::new(config, 9);

        for now in 0..5 {
            assert_eq!(a.generate_jobs(now).unwrap(), b.generate_jobs(now).unwrap());
        }
        assert_eq!(a.remaining_jobs(), None);
        assert!(!a.is_replay());
    }

    #[test]
    fn test_generator_respects_bounds() {
        let config = GeneratorConfig {
            arrival_probability: 1.0,
            max_jobs_per_tick: 3,
            max_gpus_per_job: 2,
            min_minutes: 1.0,
            max_minutes: 2.0,
        };
        let mut generator = JobGenerator::new(config, 1);
        for now in 0..20 {
            let batch = generator.generate_jobs(now).unwrap();
            assert!((1..=3).contains(&batch.len()));
            for record in batch {
                assert_eq!(record.normalized_time, now as f64);
                assert!((1..=2).contains(&record.used_gpus));
                assert!((1.0..=2.0).contains(&record.minutes));
                assert!(record.memory_max >= record.memory_avg);
            }
        }
    }

    #[test]
    fn test_generator_silent_without_arrivals() {
        let config = GeneratorConfig {
            arrival_probability: 0.0,
            ..GeneratorConfig::default()
        };
        let mut generator = JobGenerator::new(config, 1);
        assert!(generator.generate_jobs(0).unwrap().is_empty());
    }
}
