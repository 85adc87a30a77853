//! Subscriber setup for binaries, tests and benchmarks that want to see solver output.
//!
//! The library only emits `tracing` events: per-iteration lines at DEBUG, termination at
//! INFO. Nothing is printed until a subscriber is installed, either by the host application
//! or by one of the functions here.

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Filter honoring `RUST_LOG`, falling back to `default_level` for every target.
fn solver_filter(default_level: Level) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
}

/// Install a stderr subscriber at INFO.
///
/// ```no_run
/// lsq_solver::init_logger();
/// tracing::info!("ready");
/// ```
pub fn init_logger() -> bool {
    init_logger_with_level(Level::INFO)
}

/// Install a stderr subscriber whose level defaults to `default_level`.
///
/// `RUST_LOG` still wins when set, e.g. `RUST_LOG=lsq_solver::optimizer=debug` for the
/// iteration table. Returns `false` when a global subscriber was already in place, in which
/// case nothing changes.
pub fn init_logger_with_level(default_level: Level) -> bool {
    tracing_subscriber::fmt()
        .with_env_filter(solver_filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(true)
        .compact()
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_is_a_no_op() {
        init_logger_with_level(Level::WARN);
        assert!(!init_logger());
        tracing::info!("still logging through the first subscriber");
    }
}
