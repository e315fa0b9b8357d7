//! Tracing subscriber setup for the CLI

use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

use crate::error::{Error, Result};

/// Default filter directive for a verbosity level
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "distilkit=info,warn",
        1 => "distilkit=debug,info",
        2 => "distilkit=trace,debug",
        _ => "trace",
    }
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the verbosity flag when it is set.
pub fn init_logging(verbosity: u8, quiet: bool, json_output: bool) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(verbosity, quiet)));

    let registry = tracing_subscriber::registry();

    let installed = if json_output {
        let json_layer = fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(env_filter);
        registry.with(json_layer).try_init()
    } else {
        let fmt_layer = fmt::layer()
            .with_target(false)
            .with_span_events(FmtSpan::CLOSE)
            .with_filter(env_filter);
        registry.with(fmt_layer).try_init()
    };

    installed.map_err(|e| Error::config(format!("failed to install tracing subscriber: {e}")))
}
