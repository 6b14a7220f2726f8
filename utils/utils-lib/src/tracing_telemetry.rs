use crate::DEFAULT_LOG_FILTER;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Fmt Layer for console output.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FmtLayer {
    /// Output traces to stdout.
    Stdout,
    /// Output traces to stderr.
    Stderr,
    /// Don't output traces to console.
    None,
}

/// Tracing telemetry style.
#[derive(Debug, Clone, Copy, Eq, PartialEq, strum_macros::EnumString, strum_macros::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum FmtStyle {
    /// Compact style.
    Compact,
    /// Pretty Style.
    Pretty,
    /// JSON Style.
    Json,
}

/// Tracing telemetry builder.
#[derive(Debug)]
pub struct TracingTelemetry {
    writer: FmtLayer,
    style: FmtStyle,
    colours: bool,
    default_filter: String,
}

impl TracingTelemetry {
    /// Tracing telemetry default builder.
    pub fn builder() -> Self {
        Self {
            writer: FmtLayer::Stdout,
            style: FmtStyle::Pretty,
            colours: true,
            default_filter: DEFAULT_LOG_FILTER.to_string(),
        }
    }
    /// Specify writer stream.
    pub fn with_writer(self, writer: FmtLayer) -> TracingTelemetry {
        TracingTelemetry { writer, ..self }
    }
    /// Specify style.
    pub fn with_style(self, style: FmtStyle) -> TracingTelemetry {
        TracingTelemetry { style, ..self }
    }
    /// Specify whether colour is needed or not.
    pub fn with_colours(self, colours: bool) -> TracingTelemetry {
        TracingTelemetry { colours, ..self }
    }
    /// Specify the filter directives used when `RUST_LOG` is not set.
    pub fn with_default_filter(self, default_filter: impl Into<String>) -> TracingTelemetry {
        TracingTelemetry {
            default_filter: default_filter.into(),
            ..self
        }
    }

    /// The filter from `RUST_LOG`, falling back to the default directives.
    fn env_filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.default_filter))
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
    }

    /// Initialize the telemetry instance.
    pub fn init(self, service_name: &str) {
        let stdout = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_ansi(self.colours);
        let stderr = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(self.colours);

        let subscriber = Registry::default().with(self.env_filter());

        match (self.writer, self.style) {
            (FmtLayer::Stdout, FmtStyle::Compact) => subscriber.with(stdout.compact()).init(),
            (FmtLayer::Stderr, FmtStyle::Compact) => subscriber.with(stderr.compact()).init(),
            (FmtLayer::Stdout, FmtStyle::Pretty) => subscriber.with(stdout.pretty()).init(),
            (FmtLayer::Stderr, FmtStyle::Pretty) => subscriber.with(stderr.pretty()).init(),
            (FmtLayer::Stdout, FmtStyle::Json) => subscriber.with(stdout.json()).init(),
            (FmtLayer::Stderr, FmtStyle::Json) => subscriber.with(stderr.json()).init(),
            (FmtLayer::None, _) => subscriber.init(),
        }

        tracing::debug!(service = service_name, "Tracing initialised");
    }
}
