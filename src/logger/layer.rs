use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, fmt};

use super::{LOGGER_TARGET, LogLevel, Logger};

/// Forwards `tracing` events into a [`Logger`] buffer.
pub struct BufferLayer {
    logger: Arc<Logger>,
}

impl BufferLayer {
    pub fn new(logger: Arc<Logger>) -> Self {
        Self { logger }
    }
}

impl<S> Layer<S> for BufferLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _: Context<'_, S>) {
        let meta = event.metadata();

        // events the logger itself emitted are already buffered
        if meta.target() == LOGGER_TARGET {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let context = if visitor.fields.is_empty() {
            Value::Null
        } else {
            Value::Object(visitor.fields)
        };

        self.logger.record(
            LogLevel::from(*meta.level()),
            visitor.message,
            context,
            meta.target(),
            false,
        );
    }
}

impl From<tracing::Level> for LogLevel {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::ERROR => LogLevel::Error,
            tracing::Level::WARN => LogLevel::Warn,
            tracing::Level::INFO => LogLevel::Info,
            _ => LogLevel::Debug,
        }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: Map<String, Value>,
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().into(), value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().into(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().into(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.fields.insert(field.name().into(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().into(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .insert(field.name().into(), format!("{value:?}").into());
        }
    }
}

/// Installs a global fmt subscriber filtered by `filter` (an `EnvFilter`
/// directive such as `"info,kansoku=debug"`), optionally bridging events into
/// `logger`. Returns `false` if a global subscriber was already installed.
pub fn init_tracing(filter: &str, logger: Option<Arc<Logger>>) -> bool {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(logger.map(BufferLayer::new))
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::LoggerConfig;
    use crate::persist::NoopSink;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_layer_captures_events() {
        let logger = Arc::new(Logger::new(LoggerConfig::default(), Arc::new(NoopSink)));
        let subscriber = tracing_subscriber::registry().with(BufferLayer::new(logger.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(endpoint = "/whois", status = 200u64, "request finished");
            tracing::debug!("below the default level");
            logger.info("direct", Value::Null);
        });

        let recent = logger.recent(10);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].message, "request finished");
        assert_eq!(recent[0].context["endpoint"], "/whois");
        assert_eq!(recent[0].context["status"], 200);
        assert_eq!(recent[1].message, "direct");
    }
}
