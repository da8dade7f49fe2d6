use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::observer::ObserverHandle;

/// A 12-byte random identifier, hex-encoded. Interface-only — there is
/// exactly one way to make one.
pub struct JobId;

impl JobId {
    pub fn generate() -> String {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        hex::encode(bytes)
    }
}

/// An error recorded while extracting a typed argument from [`Job::args`].
/// Argument-coercion helpers themselves (`arg_string`, `arg_i64`, ...) share
/// this one mechanism: the first extraction error wins and later ones are
/// ignored.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ArgError(pub String);

/// A single unit of work. Serialized as canonical JSON; unknown fields are
/// tolerated on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
    pub enqueued_at: i64,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub unique_key: Option<String>,
    #[serde(default)]
    pub fails: u32,
    #[serde(default)]
    pub last_err: Option<String>,
    #[serde(default)]
    pub failed_at: Option<i64>,

    // Out-of-band, per-live-job bookkeeping. Never serialized: these track
    // where the raw payload came from, and which keys govern its job
    // type's concurrency slot, so `ack` knows what to update.
    #[serde(skip)]
    pub(crate) raw: Vec<u8>,
    #[serde(skip)]
    pub(crate) dequeued_from: String,
    #[serde(skip)]
    pub(crate) in_progress_list: String,
    #[serde(skip)]
    pub(crate) lock_key: String,
    #[serde(skip)]
    pub(crate) lock_info_key: String,
    #[serde(skip)]
    arg_error: Option<ArgError>,
    #[serde(skip)]
    observer: Option<ObserverHandle>,
}

impl Job {
    pub fn new(name: impl Into<String>, args: Map<String, Value>, enqueued_at: i64) -> Job {
        Job {
            id: JobId::generate(),
            name: name.into(),
            args,
            enqueued_at,
            unique: false,
            unique_key: None,
            fails: 0,
            last_err: None,
            failed_at: None,
            raw: Vec::new(),
            dequeued_from: String::new(),
            in_progress_list: String::new(),
            lock_key: String::new(),
            lock_info_key: String::new(),
            arg_error: None,
            observer: None,
        }
    }

    pub(crate) fn from_payload(
        raw: Vec<u8>,
        dequeued_from: String,
        in_progress_list: String,
        lock_key: String,
        lock_info_key: String,
    ) -> serde_json::Result<Job> {
        let mut job: Job = serde_json::from_slice(&raw)?;
        job.raw = raw;
        job.dequeued_from = dequeued_from;
        job.in_progress_list = in_progress_list;
        job.lock_key = lock_key;
        job.lock_info_key = lock_info_key;
        Ok(job)
    }

    pub fn serialize(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub(crate) fn mark_failed(&mut self, err: &str, now: i64) {
        self.fails += 1;
        self.last_err = Some(err.to_string());
        self.failed_at = Some(now);
    }

    pub(crate) fn attach_observer(&mut self, observer: ObserverHandle) {
        self.observer = Some(observer);
    }

    pub(crate) fn observer_handle(&self) -> Option<&ObserverHandle> {
        self.observer.as_ref()
    }

    /// Publish a free-form progress string to this job's worker observation.
    /// A no-op for jobs that were not dequeued by a worker (e.g. one just
    /// constructed for enqueueing).
    pub fn checkin(&self, msg: impl Into<String>) {
        if let Some(observer) = self.observer.as_ref() {
            observer.checkin(msg.into());
        }
    }

    /// The first argument-extraction error recorded via
    /// [`Job::set_arg_error`], if any. Meant to be checked once, after all
    /// arguments have been extracted; later errors are dropped.
    pub fn arg_error(&self) -> Option<&ArgError> {
        self.arg_error.as_ref()
    }

    /// Record an argument-extraction error. Only the first call has any
    /// effect; later calls (from later, possibly-successful extractions)
    /// never overwrite it.
    pub fn set_arg_error(&mut self, err: ArgError) {
        self.arg_error.get_or_insert(err);
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({} #{})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_twelve_bytes_hex() {
        let id = JobId::generate();
        assert_eq!(id.len(), 24);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn job_ids_are_unique() {
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn round_trips_through_json() {
        let mut args = Map::new();
        args.insert("a".into(), Value::from(1));
        args.insert("b".into(), Value::from("cool"));
        let job = Job::new("wat", args.clone(), 100);

        let bytes = job.serialize().unwrap();
        let restored = Job::from_payload(bytes, "ready".into(), "inprogress".into(), "lock".into(), "lock_info".into()).unwrap();

        assert_eq!(restored.id, job.id);
        assert_eq!(restored.name, "wat");
        assert_eq!(restored.args, args);
        assert_eq!(restored.enqueued_at, 100);
    }

    #[test]
    fn tolerates_unknown_fields() {
        let bytes = br##"{"id":"abc","name":"wat","args":{},"t":1,"totally_unknown":true}"##;
        // enqueued_at is absent under its real name but present under a
        // legacy alias in this fixture; missing required fields should still
        // fail loudly rather than silently defaulting.
        let result: serde_json::Result<Job> = serde_json::from_slice(bytes);
        assert!(result.is_err(), "enqueued_at is required");

        let bytes = br##"{"id":"abc","name":"wat","args":{},"enqueued_at":1,"totally_unknown":true}"##;
        let job: Job = serde_json::from_slice(bytes).unwrap();
        assert_eq!(job.id, "abc");
    }

    #[test]
    fn arg_error_first_wins() {
        let mut job = Job::new("wat", Map::new(), 0);
        job.set_arg_error(ArgError("first".into()));
        job.set_arg_error(ArgError("second".into()));
        assert_eq!(job.arg_error().unwrap().0, "first");
    }

    #[test]
    fn checkin_without_observer_is_a_no_op() {
        let job = Job::new("wat", Map::new(), 0);
        job.checkin("progress");
    }
}
