// This file is part of LightNVR, a lightweight network video recorder.
// SPDX-License-Identifier: GPL-3.0-or-later

//! Installs the global `tracing` subscriber.
//!
//! All output goes to stderr. `LIGHTNVR_LOG` selects the filter (`info` by
//! default, standard `EnvFilter` directives) and `LIGHTNVR_FORMAT` the
//! encoding:
//!
//! * unset — human-readable text with RFC 3339 timestamps;
//! * `systemd` — sd-daemon priority prefixes and no timestamps (journald
//!   stamps records itself);
//! * `json` — one JSON object per line.

use tracing_core::{Event, Level, Subscriber};
use tracing_log::NormalizeEvent;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::{FmtContext, FormatFields};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

enum Format {
    Text,
    Systemd,
    Json,
}

fn format_from_env() -> Format {
    match std::env::var("LIGHTNVR_FORMAT").as_deref() {
        Ok("systemd") => Format::Systemd,
        Ok("json") => Format::Json,
        _ => Format::Text,
    }
}

fn filter_from_env() -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
        .with_env_var("LIGHTNVR_LOG")
        .from_env_lossy()
}

/// Timestamps from jiff, which the rest of the program already uses; no
/// second time crate needed.
struct JiffTimer;

impl FormatTime for JiffTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", jiff::Timestamp::now())
    }
}

/// `sd-daemon(3)` priority prefix; journald strips it and files the record
/// under that priority.
fn sd_priority(level: Level) -> &'static str {
    if level == Level::ERROR {
        "<3>"
    } else if level == Level::WARN {
        "<4>"
    } else if level == Level::INFO {
        "<5>"
    } else if level == Level::DEBUG {
        "<6>"
    } else {
        "<7>"
    }
}

/// One-line event format for journald: priority prefix, thread, target,
/// fields. Spans are not rendered; this program logs from worker threads
/// whose names already say which stream is talking.
struct SystemdFormat;

impl<S, N> tracing_subscriber::fmt::FormatEvent<S, N> for SystemdFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        // Records bridged from the `log` crate carry their real metadata
        // out of band; prefer it when present.
        let normalized = event.normalized_metadata();
        let meta = normalized.as_ref().unwrap_or_else(|| event.metadata());

        write!(writer, "{}", sd_priority(*meta.level()))?;
        let thread = std::thread::current();
        if let Some(name) = thread.name() {
            write!(writer, "{name} ")?;
        }
        write!(writer, "{}: ", meta.target())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// Routes panics through the subscriber so they land in the same stream, in
/// the same format, as everything else.
fn log_panic(info: &std::panic::PanicHookInfo) {
    let message = info
        .payload()
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| info.payload().downcast_ref::<String>().map(String::as_str));
    tracing::error!(
        target: "panic",
        location = info.location().map(tracing::field::display),
        backtrace = %std::backtrace::Backtrace::force_capture(),
        "{}",
        message.unwrap_or("panic"),
    );
}

fn set(subscriber: impl Subscriber + Send + Sync + 'static) {
    tracing::subscriber::set_global_default(subscriber).expect("install() called exactly once");
}

pub fn install() {
    let filter = filter_from_env();
    tracing_log::LogTracer::init().expect("install() called exactly once");

    let layer = tracing_subscriber::fmt::Layer::new().with_writer(std::io::stderr);
    match format_from_env() {
        Format::Text => set(tracing_subscriber::registry().with(
            layer
                .with_timer(JiffTimer)
                .with_thread_names(true)
                .with_filter(filter),
        )),
        Format::Systemd => set(tracing_subscriber::registry().with(
            layer
                .with_ansi(false)
                .event_format(SystemdFormat)
                .with_filter(filter),
        )),
        Format::Json => set(tracing_subscriber::registry().with(
            layer.with_thread_names(true).json().with_filter(filter),
        )),
    }

    // Opt-out knob for debugging the hook itself.
    if std::env::var_os("LIGHTNVR_NO_PANIC_HOOK").is_none() {
        std::panic::set_hook(Box::new(log_panic));
    }
}

/// Variant for tests: writes through the test-capture writer and tolerates
/// being raced by other tests' installs.
pub fn install_for_tests() {
    let filter = filter_from_env();
    let _ = tracing_log::LogTracer::init();
    let _ = tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::Layer::new()
                .with_test_writer()
                .with_timer(JiffTimer)
                .with_thread_names(true)
                .with_filter(filter),
        ),
    );
}
