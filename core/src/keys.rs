//! Namespaced key layout. Every function here is a pure string builder;
//! nothing here touches Redis.

fn normalize_namespace(namespace: &str) -> String {
    if namespace.is_empty() || namespace.ends_with(':') {
        namespace.to_string()
    } else {
        format!("{}:", namespace)
    }
}

/// The fixed key family for a single registered job type. Built once per
/// job name per pool and reused on every fetch/ack, so the hot path never
/// reformats these strings.
#[derive(Debug, Clone)]
pub struct JobNameKeys {
    pub name: String,
    /// `jobs:<name>` — the ready list.
    pub ready: String,
    /// `jobs:<name>:paused`
    pub paused: String,
    /// `jobs:<name>:lock`
    pub lock: String,
    /// `jobs:<name>:lock_info`
    pub lock_info: String,
    /// `jobs:<name>:max_concurrency`
    pub max_concurrency: String,
}

impl JobNameKeys {
    pub fn new(namespace: &str, name: &str) -> Self {
        let prefix = jobs_prefix(namespace);
        JobNameKeys {
            name: name.to_string(),
            ready: format!("{}{}", prefix, name),
            paused: format!("{}{}:paused", prefix, name),
            lock: format!("{}{}:lock", prefix, name),
            lock_info: format!("{}{}:lock_info", prefix, name),
            max_concurrency: format!("{}{}:max_concurrency", prefix, name),
        }
    }

    /// `jobs:<name>:<poolID>:inprogress`
    pub fn in_progress(&self, pool_id: &str) -> String {
        format!("{}:{}:inprogress", self.ready, pool_id)
    }
}

pub fn jobs_prefix(namespace: &str) -> String {
    format!("{}jobs:", normalize_namespace(namespace))
}

pub fn jobs(namespace: &str, name: &str) -> String {
    format!("{}{}", jobs_prefix(namespace), name)
}

pub fn jobs_in_progress(namespace: &str, name: &str, pool_id: &str) -> String {
    format!("{}:{}:inprogress", jobs(namespace, name), pool_id)
}

pub fn jobs_paused(namespace: &str, name: &str) -> String {
    format!("{}:paused", jobs(namespace, name))
}

pub fn jobs_lock(namespace: &str, name: &str) -> String {
    format!("{}:lock", jobs(namespace, name))
}

pub fn jobs_lock_info(namespace: &str, name: &str) -> String {
    format!("{}:lock_info", jobs(namespace, name))
}

pub fn jobs_max_concurrency(namespace: &str, name: &str) -> String {
    format!("{}:max_concurrency", jobs(namespace, name))
}

pub fn scheduled(namespace: &str) -> String {
    format!("{}scheduled", normalize_namespace(namespace))
}

pub fn retry(namespace: &str) -> String {
    format!("{}retry", normalize_namespace(namespace))
}

pub fn dead(namespace: &str) -> String {
    format!("{}dead", normalize_namespace(namespace))
}

pub fn known_jobs(namespace: &str) -> String {
    format!("{}known_jobs", normalize_namespace(namespace))
}

pub fn worker_pools(namespace: &str) -> String {
    format!("{}worker_pools", normalize_namespace(namespace))
}

pub fn worker_pool_heartbeat(namespace: &str, pool_id: &str) -> String {
    format!("{}{}", normalize_namespace(namespace), pool_id)
}

pub fn worker_observation(namespace: &str, worker_id: &str) -> String {
    format!("{}worker:{}", normalize_namespace(namespace), worker_id)
}

pub fn last_periodic_enqueue(namespace: &str) -> String {
    format!("{}last_periodic_enqueue", normalize_namespace(namespace))
}

pub fn unique(namespace: &str, fingerprint: &str) -> String {
    format!("{}unique:{}", normalize_namespace(namespace), fingerprint)
}

/// The key family shared across all job names, built once per pool/client
/// so hot paths (reap, requeue, periodic enqueue) never reformat these
/// strings.
#[derive(Debug, Clone)]
pub struct GlobalKeys {
    pub scheduled: String,
    pub retry: String,
    pub dead: String,
    pub known_jobs: String,
    pub worker_pools: String,
    pub last_periodic_enqueue: String,
}

impl GlobalKeys {
    pub fn new(namespace: &str) -> Self {
        GlobalKeys {
            scheduled: scheduled(namespace),
            retry: retry(namespace),
            dead: dead(namespace),
            known_jobs: known_jobs(namespace),
            worker_pools: worker_pools(namespace),
            last_periodic_enqueue: last_periodic_enqueue(namespace),
        }
    }
}
