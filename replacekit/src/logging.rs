use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `replacekit=debug` with `verbose`
/// and `replacekit=info` without. Logs go to stderr so JSON output on
/// stdout stays parseable. Calling this twice is harmless.
pub fn init(verbose: bool) {
    let default_directive = if verbose {
        "replacekit=debug"
    } else {
        "replacekit=info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    if tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
}
