//! Structured logging setup. Called once in `main`, before the Store is
//! opened.

use crate::config::LoggingSettings;

pub fn init(settings: &LoggingSettings) {
    let filter = tracing_subscriber::EnvFilter::try_new(&settings.level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if settings.format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}
