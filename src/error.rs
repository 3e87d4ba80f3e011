use thiserror::Error;

/// Conditions the starter cannot route through its event graph.
///
/// Every variant is fatal: `StateMachine::execute` stops with it and the
/// binary runs the exception cleanup before exiting.
#[derive(Debug, Error)]
pub enum StarterError {
    #[error("no state entry for {0}")]
    NoState(String),

    #[error("no transition from {state} on {event}")]
    NoTransition { state: String, event: String },

    #[error("event handler: {0}")]
    Handler(String),

    #[error("lost connection to the shadow")]
    ShadowLost,

    #[error("shadow error: {0}")]
    Shadow(#[from] ShadowError),

    #[error("process {cluster}.{proc_id}: {reason}")]
    InvalidProcState {
        cluster: i32,
        proc_id: i32,
        reason: String,
    },

    #[error("process list is empty, no current process")]
    NoCurrentProc,

    #[error("job class {0} cannot be spawned by this starter")]
    UnsupportedJobClass(String),

    #[error("failed to signal pid {pid}: {source}")]
    Signal {
        pid: i32,
        #[source]
        source: nix::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T, E = StarterError> = std::result::Result<T, E>;

/// Failures talking to the shadow. Timeouts and transfer failures are
/// reported as `false` by the transfer calls, these are the rest.
#[derive(Debug, Error)]
pub enum ShadowError {
    #[error("invalid job description: {0}")]
    InvalidJob(String),

    #[error("shadow IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}
