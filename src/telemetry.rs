use tracing_subscriber::{fmt, EnvFilter};

/// JSON logs filtered by `RUST_LOG`. Safe to call more than once; later calls are ignored.
pub fn init() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .try_init();
}
