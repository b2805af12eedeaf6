//! Subscriber setup: human log lines on stderr and, optionally, influx line
//! protocol metrics in a rolling file.
//!
//! Metrics are ordinary `tracing` events whose target starts with
//! `metrics.`; the remainder of the target is the measurement name and
//! fields prefixed with `tag_` become tags.

use std::collections::BTreeMap;
use std::fmt::{self};
use std::path::Path;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use anyhow::Context;
use anyhow::Result;
use tracing::field::Field;
use tracing::field::Visit;
use tracing::Event;
use tracing::Metadata;
use tracing::Subscriber;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::RollingFileAppender;
use tracing_appender::rolling::Rotation;
use tracing_subscriber::filter::FilterExt;
use tracing_subscriber::filter::{self};
use tracing_subscriber::fmt::layer;
use tracing_subscriber::fmt::FormatEvent;
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry;

const METRICS_PREFIX: &str = "metrics.";

pub(crate) struct InfluxFormatter;

#[derive(Default)]
struct FieldVisitor {
    tags: BTreeMap<String, String>,
    fields: BTreeMap<String, String>,
}

impl FieldVisitor {
    fn insert(&mut self, name: &str, value: String) {
        match name.strip_prefix("tag_") {
            Some(tag) => self.tags.insert(tag.to_string(), escape_tag(&value)),
            None => self.fields.insert(name.to_string(), value),
        };
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name().starts_with("tag_") {
            self.insert(field.name(), value.to_string());
        } else {
            self.insert(field.name(), format!("{value:?}"));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field.name(), format!("{:?}", value));
    }
}

fn escape_tag(value: &str) -> String {
    value
        .replace(',', "\\,")
        .replace('=', "\\=")
        .replace(' ', "\\ ")
}

impl<S, N> FormatEvent<S, N> for InfluxFormatter
where
    S: Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
    N: for<'a> tracing_subscriber::fmt::FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &tracing_subscriber::fmt::FmtContext<'_, S, N>,
        mut writer: tracing_subscriber::fmt::format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let target = event.metadata().target();
        write!(writer, "{}", target.strip_prefix(METRICS_PREFIX).unwrap_or(target))?;

        for (key, value) in visitor.tags.iter() {
            write!(writer, ",{}={}", key, value)?;
        }

        write!(writer, " ")?;
        let mut first = true;
        for (key, value) in visitor.fields.iter() {
            if !first {
                write!(writer, ",")?;
            }
            write!(writer, "{}={}", key, value)?;
            first = false;
        }

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        writeln!(writer, " {}", timestamp)
    }
}

fn is_metric(metadata: &Metadata<'_>) -> bool {
    metadata.target().starts_with(METRICS_PREFIX)
}

/// initiate the global tracing subscriber
///
/// The returned guard flushes the metrics file on drop and must be held
/// for the lifetime of the process.
pub fn init(metrics_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let fmt_layer = utils::logging::get_fmt_layer().with_filter(
        utils::logging::env_filter().and(filter::filter_fn(|metadata| !is_metric(metadata))),
    );

    let Some(metrics_file) = metrics_file else {
        registry().with(fmt_layer).init();
        return Ok(None);
    };

    let dir = metrics_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let prefix = metrics_file
        .file_name()
        .and_then(|name| name.to_str())
        .context("metrics file must name a file")?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(prefix)
        .max_log_files(3)
        .build(dir)
        .with_context(|| format!("create metrics appender in {}", dir.display()))?;
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);

    let metrics_layer = layer()
        .event_format(InfluxFormatter)
        .fmt_fields(tracing_subscriber::fmt::format::DefaultFields::new())
        .with_writer(file_writer)
        .with_ansi(false)
        .with_filter(filter::filter_fn(is_metric));

    registry().with(fmt_layer).with(metrics_layer).init();
    Ok(Some(file_guard))
}
