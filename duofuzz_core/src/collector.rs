use crate::mutator::MutationKind;
use crate::outcome::{Outcome, Status};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};

/// Default number of failing outcomes retained for the report.
pub const DEFAULT_FAILURE_SAMPLE_CAP: usize = 25;

/// Outcome counts per status tag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct StatusCounts {
    pub success: u64,
    pub application_error: u64,
    pub transport_error: u64,
    pub exception: u64,
}

impl StatusCounts {
    fn bump(&mut self, status: Status) {
        match status {
            Status::Success => self.success += 1,
            Status::ApplicationError => self.application_error += 1,
            Status::TransportError => self.transport_error += 1,
            Status::Exception => self.exception += 1,
        }
    }

    pub fn get(&self, status: Status) -> u64 {
        match status {
            Status::Success => self.success,
            Status::ApplicationError => self.application_error,
            Status::TransportError => self.transport_error,
            Status::Exception => self.exception,
        }
    }

    pub fn total(&self) -> u64 {
        self.success + self.errors()
    }

    pub fn errors(&self) -> u64 {
        self.application_error + self.transport_error + self.exception
    }
}

/// Accumulates outcomes for one run. The only stateful component of the pipeline.
#[derive(Debug)]
pub struct ResultCollector {
    target: String,
    failure_sample_cap: usize,
    total_attempts: u64,
    by_status: StatusCounts,
    by_kind: BTreeMap<MutationKind, StatusCounts>,
    failure_sample: VecDeque<Outcome>,
    failing_inputs: HashSet<String>,
    started_at: DateTime<Utc>,
}

impl ResultCollector {
    pub fn new(target: impl Into<String>, failure_sample_cap: usize) -> Self {
        Self {
            target: target.into(),
            failure_sample_cap,
            total_attempts: 0,
            by_status: StatusCounts::default(),
            by_kind: BTreeMap::new(),
            failure_sample: VecDeque::with_capacity(failure_sample_cap),
            failing_inputs: HashSet::new(),
            started_at: Utc::now(),
        }
    }

    /// Counts `outcome` and, if it is a failure, appends it to the bounded sample.
    ///
    /// Once the sample is full the oldest failure is evicted.
    pub fn record(&mut self, outcome: Outcome) {
        self.total_attempts += 1;
        self.by_status.bump(outcome.status);
        self.by_kind.entry(outcome.kind).or_default().bump(outcome.status);

        if !outcome.status.is_failure() {
            return;
        }
        if outcome.status == Status::Exception {
            log::error!(
                "Unclassified failure for {} ({}): {}",
                outcome.kind,
                outcome.payload,
                outcome.detail.as_deref().unwrap_or("no detail")
            );
        }
        self.failing_inputs.insert(outcome.input_hash());
        if self.failure_sample_cap == 0 {
            return;
        }
        if self.failure_sample.len() == self.failure_sample_cap {
            self.failure_sample.pop_front();
        }
        self.failure_sample.push_back(outcome);
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    pub fn failure_count(&self) -> u64 {
        self.by_status.errors()
    }

    /// Freezes the collector into a read-only summary.
    pub fn finalize(self, cancelled: bool) -> RunSummary {
        RunSummary {
            target: self.target,
            total_attempts: self.total_attempts,
            by_status: self.by_status,
            by_kind: self.by_kind,
            failure_sample: self.failure_sample.into_iter().collect(),
            failure_sample_cap: self.failure_sample_cap,
            unique_failing_inputs: self.failing_inputs.len(),
            started_at: self.started_at,
            finished_at: Utc::now(),
            cancelled,
        }
    }
}

/// The finalized aggregate of one run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    target: String,
    total_attempts: u64,
    by_status: StatusCounts,
    by_kind: BTreeMap<MutationKind, StatusCounts>,
    failure_sample: Vec<Outcome>,
    failure_sample_cap: usize,
    unique_failing_inputs: usize,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    cancelled: bool,
}

impl RunSummary {
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    pub fn success_count(&self) -> u64 {
        self.by_status.success
    }

    pub fn error_count(&self) -> u64 {
        self.by_status.errors()
    }

    pub fn count(&self, status: Status) -> u64 {
        self.by_status.get(status)
    }

    pub fn status_counts(&self) -> &StatusCounts {
        &self.by_status
    }

    pub fn kind_counts(&self) -> &BTreeMap<MutationKind, StatusCounts> {
        &self.by_kind
    }

    /// Most recent failures, oldest first.
    pub fn failure_sample(&self) -> &[Outcome] {
        &self.failure_sample
    }

    pub fn failure_sample_cap(&self) -> usize {
        self.failure_sample_cap
    }

    pub fn unique_failing_inputs(&self) -> usize {
        self.unique_failing_inputs
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> DateTime<Utc> {
        self.finished_at
    }

    pub fn cancelled(&self) -> bool {
        self.cancelled
    }
}
