/// Development helper: install a fmt subscriber when `RUST_LOG` is set.
///
/// Tests and benches call `wharf::dev_tracing::init_tracing()` to see the
/// fabric's structured logs (every event carries a `socket` field). A no-op
/// when `RUST_LOG` is unset or a global subscriber is already installed.
pub fn init_tracing() {
    if std::env::var_os("RUST_LOG").is_some() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_thread_names(true)
            .try_init();
    }
}
