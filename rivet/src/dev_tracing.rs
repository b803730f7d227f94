//! Development tracing setup.

/// Install a `fmt` subscriber filtered by `RUST_LOG`, if it is set.
///
/// Tests and demos can call `rivet::dev_tracing::init_tracing()` to see
/// connection lifecycle logs, e.g. `RUST_LOG=rivet_wire=debug`. This is a
/// no-op when `RUST_LOG` is not set or a global subscriber already exists,
/// so calling it from every test is fine.
pub fn init_tracing() {
    use std::env;

    if env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}
