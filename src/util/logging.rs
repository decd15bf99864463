//! Standardized log targets for kmsflip
//!
//! Every `tracing` call in the crate names one of these targets so that
//! `RUST_LOG=info,SCHED=trace` style filters can isolate a component.

use tracing_subscriber::EnvFilter;

/// Standardized module identifiers
pub const MAIN: &str = "MAIN";
pub const KMS: &str = "KMS";
pub const POOL: &str = "POOL";
pub const SCHED: &str = "SCHED";
pub const LOOP: &str = "LOOP";
pub const INPUT: &str = "INPUT";
pub const SOURCE: &str = "SOURCE";

/// Default filter when `RUST_LOG` is not set.
///
/// Directives name the targets above, not the crate path.
pub const DEFAULT_FILTER: &str = "info,MAIN=debug,KMS=debug,POOL=debug,SCHED=debug,LOOP=debug,INPUT=debug,SOURCE=debug";

/// Install the process-wide subscriber.
///
/// All binaries share the `YYYY-MM-DD HH:MM:SS LEVEL target: message` layout.
pub fn init(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("trace")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
    };

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = tracing_subscriber::fmt()
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::new(
            "%Y-%m-%d %H:%M:%S".to_string(),
        ))
        .with_ansi(false)
        .with_env_filter(filter)
        .try_init();
}
