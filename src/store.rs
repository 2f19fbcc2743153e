//! Shared job-state store.
//!
//! Jobs are identified by caller-supplied string ids. The decode loop
//! appends output as tokens are generated; API-facing readers poll partial
//! output concurrently. A single `RwLock`-guarded map keeps writers (one
//! per active slot) and readers (arbitrarily many pollers) consistent:
//! readers always observe a prefix of the final output, never interleaved
//! or torn text.

use std::collections::HashMap;
use std::sync::RwLock;

/// Per-job state, created on first write and kept until removed.
#[derive(Debug, Clone, Default)]
pub struct JobEntry {
    /// Accumulated output text, including the echoed prompt.
    pub output: String,
    /// Number of prompt tokens after tokenization.
    pub prompt_tokens: usize,
    /// Number of tokens generated so far.
    pub output_tokens: usize,
    /// Average milliseconds per token during prompt evaluation.
    pub prompt_eval_ms: f64,
    /// Average milliseconds per token during generation.
    pub gen_eval_ms: f64,
}

/// Concurrent store of job state, shared between decode loops and pollers.
#[derive(Debug, Default)]
pub struct SessionStore {
    jobs: RwLock<HashMap<String, JobEntry>>,
}

impl SessionStore {
    pub fn new() -> Self {
        SessionStore::default()
    }

    /// Append a piece of output text to a job, creating the entry if this
    /// is the job's first write.
    pub fn append_output(&self, job_id: &str, text: &str) {
        let mut jobs = self.jobs.write().expect("job map poisoned");
        jobs.entry(job_id.to_string()).or_default().output.push_str(text);
    }

    /// Record one generated token against the job's counter.
    pub fn add_output_token(&self, job_id: &str) {
        let mut jobs = self.jobs.write().expect("job map poisoned");
        jobs.entry(job_id.to_string()).or_default().output_tokens += 1;
    }

    /// Record the prompt token count once tokenization is done.
    pub fn set_prompt_token_count(&self, job_id: &str, count: usize) {
        let mut jobs = self.jobs.write().expect("job map poisoned");
        jobs.entry(job_id.to_string()).or_default().prompt_tokens = count;
    }

    /// Record the final timing averages for a finished job.
    pub fn record_timings(&self, job_id: &str, prompt_eval_ms: f64, gen_eval_ms: f64) {
        let mut jobs = self.jobs.write().expect("job map poisoned");
        let entry = jobs.entry(job_id.to_string()).or_default();
        entry.prompt_eval_ms = prompt_eval_ms;
        entry.gen_eval_ms = gen_eval_ms;
    }

    /// The output accumulated so far, or `None` for an unknown job.
    pub fn partial_output(&self, job_id: &str) -> Option<String> {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.get(job_id).map(|e| e.output.clone())
    }

    /// Full snapshot of a job's state, or `None` for an unknown job.
    pub fn entry(&self, job_id: &str) -> Option<JobEntry> {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.get(job_id).cloned()
    }

    pub fn prompt_token_count(&self, job_id: &str) -> Option<usize> {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.get(job_id).map(|e| e.prompt_tokens)
    }

    pub fn output_token_count(&self, job_id: &str) -> Option<usize> {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.get(job_id).map(|e| e.output_tokens)
    }

    /// Average milliseconds per token spent evaluating the prompt.
    pub fn prompt_eval_latency(&self, job_id: &str) -> Option<f64> {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.get(job_id).map(|e| e.prompt_eval_ms)
    }

    /// Average milliseconds per generated token.
    pub fn gen_eval_latency(&self, job_id: &str) -> Option<f64> {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.get(job_id).map(|e| e.gen_eval_ms)
    }

    pub fn contains(&self, job_id: &str) -> bool {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.contains_key(job_id)
    }

    /// Drop a job's state. A no-op for unknown ids.
    pub fn remove(&self, job_id: &str) {
        let mut jobs = self.jobs.write().expect("job map poisoned");
        jobs.remove(job_id);
    }

    pub fn len(&self) -> usize {
        let jobs = self.jobs.read().expect("job map poisoned");
        jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_append_creates_entry() {
        let store = SessionStore::new();
        assert!(!store.contains("a"));
        store.append_output("a", "hello");
        assert_eq!(store.partial_output("a").as_deref(), Some("hello"));
    }

    #[test]
    fn appends_accumulate_in_order() {
        let store = SessionStore::new();
        store.append_output("a", "one ");
        store.append_output("a", "two ");
        store.append_output("a", "three");
        assert_eq!(store.partial_output("a").as_deref(), Some("one two three"));
    }

    #[test]
    fn unknown_job_reads_as_none() {
        let store = SessionStore::new();
        assert!(store.partial_output("missing").is_none());
        assert!(store.prompt_token_count("missing").is_none());
        assert!(store.output_token_count("missing").is_none());
    }

    #[test]
    fn counters_and_timings_round_trip() {
        let store = SessionStore::new();
        store.set_prompt_token_count("a", 12);
        store.add_output_token("a");
        store.add_output_token("a");
        store.record_timings("a", 3.5, 41.0);

        let entry = store.entry("a").unwrap();
        assert_eq!(entry.prompt_tokens, 12);
        assert_eq!(entry.output_tokens, 2);
        assert_eq!(entry.prompt_eval_ms, 3.5);
        assert_eq!(entry.gen_eval_ms, 41.0);
    }

    #[test]
    fn remove_forgets_the_job() {
        let store = SessionStore::new();
        store.append_output("a", "x");
        store.remove("a");
        assert!(!store.contains("a"));
        assert!(store.is_empty());
        // Removing again is harmless.
        store.remove("a");
    }

    #[test]
    fn jobs_are_isolated() {
        let store = SessionStore::new();
        store.append_output("a", "alpha");
        store.append_output("b", "beta");
        assert_eq!(store.partial_output("a").as_deref(), Some("alpha"));
        assert_eq!(store.partial_output("b").as_deref(), Some("beta"));
        assert_eq!(store.len(), 2);
    }
}
