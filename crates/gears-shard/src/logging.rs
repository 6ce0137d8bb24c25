use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `verbose`. Returns false when a
/// subscriber was already installed.
pub fn init_logging(verbose: bool) -> bool {
    let filter = if verbose {
        "gears_shard=debug,gears_executor=debug,gears_registry=debug,gears_cluster=debug"
    } else {
        "gears_shard=info,gears_executor=info,gears_registry=info,gears_cluster=warn"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok()
}
