pub mod metrics;

use tracing_subscriber::EnvFilter;

pub fn init_tracing(log_level: &str, json: bool) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .with_target(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
