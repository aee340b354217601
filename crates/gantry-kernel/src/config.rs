use std::path::PathBuf;
use std::time::Duration;

/// Kernel tunables. `Default` gives working local values; `from_env` layers
/// `GANTRY_*` overrides on top.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    /// Deadline applied to every mesh call the kernel makes.
    pub mesh_timeout: Duration,
    /// Bounded depth of every component mailbox.
    pub mailbox_depth: usize,
    /// Bound on waiting for a per-base-path commit lock.
    pub commit_deadline: Duration,
    /// Fallback scheduler wakeup when no submission arrives.
    pub poll_interval: Duration,
    /// Root for session copies and commit journals.
    pub scratch_root: PathBuf,
    /// First retry delay after the state store reports unavailable.
    pub backoff_initial: Duration,
    /// Retry delay ceiling.
    pub backoff_max: Duration,
    /// Sessions idle past this are force-aborted by the supervisor.
    /// `None` disables the sweep.
    pub session_idle_deadline: Option<Duration>,
    /// Claimant identity recorded on task rows.
    pub worker_id: String,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            mesh_timeout: Duration::from_secs(30),
            mailbox_depth: 64,
            commit_deadline: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            scratch_root: std::env::temp_dir().join("gantry-scratch"),
            backoff_initial: Duration::from_millis(100),
            backoff_max: Duration::from_secs(10),
            session_idle_deadline: Some(Duration::from_secs(15 * 60)),
            worker_id: format!("kernel-{}", std::process::id()),
        }
    }
}

impl KernelConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(d) = env_ms("GANTRY_MESH_TIMEOUT_MS") {
            config.mesh_timeout = d;
        }
        if let Some(depth) = env_parse::<usize>("GANTRY_MAILBOX_DEPTH") {
            config.mailbox_depth = depth;
        }
        if let Some(d) = env_ms("GANTRY_COMMIT_DEADLINE_MS") {
            config.commit_deadline = d;
        }
        if let Some(d) = env_ms("GANTRY_POLL_INTERVAL_MS") {
            config.poll_interval = d;
        }
        if let Ok(dir) = std::env::var("GANTRY_SCRATCH_DIR") {
            config.scratch_root = PathBuf::from(dir);
        }
        if let Some(d) = env_ms("GANTRY_BACKOFF_INITIAL_MS") {
            config.backoff_initial = d;
        }
        if let Some(d) = env_ms("GANTRY_BACKOFF_MAX_MS") {
            config.backoff_max = d;
        }
        // Zero disables the idle sweep.
        if let Some(d) = env_ms("GANTRY_SESSION_IDLE_MS") {
            config.session_idle_deadline = (!d.is_zero()).then_some(d);
        }
        if let Ok(id) = std::env::var("GANTRY_WORKER_ID") {
            config.worker_id = id;
        }
        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_ms(key: &str) -> Option<Duration> {
    env_parse::<u64>(key).map(Duration::from_millis)
}
