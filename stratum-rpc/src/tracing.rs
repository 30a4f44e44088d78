//! Log output for binaries built on this crate.
//!
//! The library itself only emits `tracing` events. A program that wants to
//! see them calls [`init_stdout`] once at startup. Library modules use the
//! macros in [`prelude`].

use std::fmt;
use std::io::IsTerminal;

use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{
        FmtContext, FormatEvent, FormatFields,
        format::{DefaultFields, Writer as FmtWriter},
        time::FormatTime,
    },
    prelude::*,
    registry::LookupSpan,
};

pub mod prelude {
    #[allow(unused_imports)]
    pub use tracing::{debug, error, info, trace, warn};
}

/// Log to stdout.
///
/// `default_level` applies unless `RUST_LOG` says otherwise. Colors are used
/// only when stdout is a terminal.
pub fn init_stdout(default_level: LevelFilter) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var("RUST_LOG")
        .from_env_lossy();

    let formatter = LineFormatter {
        color: std::io::stdout().is_terminal(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .fmt_fields(DefaultFields::new())
                .event_format(formatter),
        )
        .init();
}

/// One event per line: time, level, short target, message, then any
/// structured fields dimmed on a continuation line.
struct LineFormatter {
    color: bool,
}

impl LineFormatter {
    fn paint(&self, writer: &mut FmtWriter<'_>, code: &str, text: &str) -> fmt::Result {
        if self.color {
            write!(writer, "\x1b[{code}m{text}\x1b[0m")
        } else {
            write!(writer, "{text}")
        }
    }
}

#[derive(Default)]
struct Fields {
    message: Option<String>,
    pairs: Vec<(&'static str, String)>,
}

impl Visit for Fields {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.pairs.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.pairs.push((field.name(), format!("{value:?}")));
        }
    }
}

impl<S, N> FormatEvent<S, N> for LineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut fields = Fields::default();
        event.record(&mut fields);

        LocalTimer.format_time(&mut writer)?;
        write!(writer, " ")?;

        let (code, label) = match *event.metadata().level() {
            Level::ERROR => ("31", "ERROR"),
            Level::WARN => ("33", "WARN "),
            Level::INFO => ("32", "INFO "),
            Level::DEBUG => ("34", "DEBUG"),
            Level::TRACE => ("35", "TRACE"),
        };
        self.paint(&mut writer, code, label)?;

        let target = event.metadata().target();
        let target = target.strip_prefix("stratum_rpc::").unwrap_or(target);
        write!(writer, " {target}: ")?;

        if let Some(message) = &fields.message {
            write!(writer, "{message}")?;
        }

        if !fields.pairs.is_empty() {
            let joined = fields
                .pairs
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(", ");

            // Line up under the target: "HH:MM:SS LEVEL "
            writeln!(writer)?;
            write!(writer, "{:15}", "")?;
            self.paint(&mut writer, "90", &joined)?;
        }

        writeln!(writer)
    }
}

/// Local wall-clock time to the second.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut FmtWriter<'_>) -> fmt::Result {
        let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
        let formatted = now
            .format(time::macros::format_description!(
                "[hour]:[minute]:[second]"
            ))
            .map_err(|_| fmt::Error)?;
        write!(w, "{formatted}")
    }
}
