//! Tracing configuration for embedding applications
//!
//! The library only emits events and spans. Applications that do not bring
//! their own subscriber can install one from here.

#[cfg(feature = "tracing-init")]
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

/// Configuration for tracing output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable output with colors
    Console,
    /// Compact output without colors, for CI and log collectors
    Compact,
    /// JSON structured logging for production environments
    #[cfg(feature = "tracing-json")]
    Json,
}

/// Tracing configuration builder
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Verbosity level (maps to log levels)
    pub verbosity: u8,
    pub format: TracingFormat,
    /// Environment filter string (overrides verbosity if set)
    pub env_filter: Option<String>,
    /// Worker or deployment name attached to the startup event
    pub service_name: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            verbosity: 0,
            format: TracingFormat::Console,
            env_filter: None,
            service_name: None,
        }
    }
}

impl TracingConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set verbosity level (0-2+)
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: u8) -> Self {
        self.verbosity = verbosity;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter<S: Into<String>>(mut self, filter: S) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    #[must_use]
    pub fn with_service_name<S: Into<String>>(mut self, name: S) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Filter directive for the verbosity level
    ///
    /// Library events are raised one level above everything else so that
    /// `-v` shows stage and model-call detail without dependency noise.
    #[must_use]
    pub fn verbosity_to_filter(&self) -> String {
        let (crate_level, default_level) = match self.verbosity {
            0 => ("info", "warn"),
            1 => ("debug", "info"),
            _ => ("trace", "debug"),
        };
        format!("{default_level},tryon_compose={crate_level}")
    }

    /// Install a global subscriber
    #[cfg(feature = "tracing-init")]
    pub fn init(self) -> anyhow::Result<()> {
        use tracing_subscriber::fmt;

        let filter = match &self.env_filter {
            Some(directives) => EnvFilter::try_new(directives)?,
            None => EnvFilter::try_new(self.verbosity_to_filter())?,
        };
        let registry = Registry::default().with(filter);

        match self.format {
            TracingFormat::Console => {
                let fmt_layer = fmt::layer()
                    .with_ansi(true)
                    .with_target(false)
                    .with_level(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            TracingFormat::Compact => {
                let fmt_layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .compact();
                registry.with(fmt_layer).try_init()?;
            },
            #[cfg(feature = "tracing-json")]
            TracingFormat::Json => {
                let fmt_layer = fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true);
                registry.with(fmt_layer).try_init()?;
            },
        }

        if let Some(service) = &self.service_name {
            tracing::info!(service = %service, "try-on worker tracing initialized");
        }
        Ok(())
    }
}

/// Minimal subscriber driven by `RUST_LOG`; a no-op if one is already set
#[cfg(feature = "tracing-init")]
pub fn init_library_tracing() -> anyhow::Result<()> {
    if tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(EnvFilter::from_default_env())
            .finish(),
    )
    .is_ok()
    {
        tracing::debug!("library tracing initialized");
    }
    Ok(())
}

/// Span constructors shared by the orchestrator
pub mod spans {
    use crate::types::GarmentCategory;
    use tracing::{Level, Span};
    use uuid::Uuid;

    /// Span covering one job from queueing to its terminal state
    #[must_use]
    pub fn job(job_id: Uuid, category: GarmentCategory) -> Span {
        tracing::span!(
            Level::INFO,
            "job",
            job_id = %job_id,
            category = %category
        )
    }

    /// Span around one stage transition, named after the artifacts it consumes
    #[must_use]
    pub fn stage(from: &'static str) -> Span {
        tracing::span!(Level::INFO, "stage", from = from)
    }
}
