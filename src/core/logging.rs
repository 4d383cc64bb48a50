use tracing::Level;

/// Install a global fmt subscriber.
///
/// `debugging` lowers the max level to DEBUG so that transport and dispatch
/// traces become visible. Calling this more than once is harmless; only the
/// first subscriber is installed.
pub fn init_logging(debugging: bool) {
    let level = if debugging { Level::DEBUG } else { Level::INFO };

    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true)
        .try_init();
}
