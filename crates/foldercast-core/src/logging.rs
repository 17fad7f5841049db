use tracing_subscriber::{fmt, EnvFilter};

/// Initialize tracing for the process.
///
/// Default: info for our crates, warn for everything else. Override with
/// `RUST_LOG`. A second call is a no-op.
pub fn init(service_name: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "warn,foldercast_core=info,foldercast_telegram=info,{service_name}=info"
        ))
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
