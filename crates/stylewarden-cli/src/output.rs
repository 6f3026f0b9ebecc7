//! Human and JSON rendering for command results.

use std::fmt::Write as _;

use anyhow::Result;
use serde::Serialize;

use stylewarden::{AttemptOutcome, EngineEvent, EngineSnapshot};

use crate::commands::{is_notable, FetchReport, SiteStatus};

/// Pretty JSON on stdout.
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn render_status(sites: &[SiteStatus]) -> String {
    if sites.is_empty() {
        return "No sites configured.\n".to_string();
    }
    let mut out = String::new();
    for site in sites {
        let _ = writeln!(
            out,
            "{:<16} {:<8} {:<10} {}",
            site.id,
            if site.enabled { "enabled" } else { "disabled" },
            site.mode,
            site.name
        );
        match &site.cache {
            Some(cache) => {
                let _ = writeln!(
                    out,
                    "  cache: {} bytes from {}, {} old{}",
                    cache.bytes,
                    cache.source,
                    format_age(cache.age_secs),
                    if cache.fresh { "" } else { " (stale)" }
                );
            }
            None => out.push_str("  cache: empty\n"),
        }
    }
    out
}

pub fn render_fetch(report: &FetchReport) -> String {
    let mut out = String::new();
    for attempt in &report.attempts {
        let detail = match &attempt.outcome {
            AttemptOutcome::Success { bytes } => format!("ok, {bytes} bytes"),
            AttemptOutcome::Failure { reason } => reason.clone(),
        };
        let _ = writeln!(
            out,
            "  {:<24} {:>6}ms  {}  {}",
            attempt.strategy, attempt.elapsed_ms, attempt.source, detail
        );
    }
    match (&report.strategy, &report.source, report.bytes) {
        (Some(strategy), Some(source), Some(bytes)) => {
            let _ = writeln!(
                out,
                "Fetched {bytes} bytes for {} via {strategy} from {source}",
                report.site
            );
        }
        _ => {
            let _ = writeln!(
                out,
                "No source for {} produced a stylesheet ({} attempts)",
                report.site,
                report.attempts.len()
            );
        }
    }
    out
}

pub fn render_snapshot(snapshot: &EngineSnapshot) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{}: {:?}, watch {:?} ({:?}, {} checks)",
        snapshot.descriptor_id,
        snapshot.state,
        snapshot.watch_state,
        snapshot.watch_mode,
        snapshot.reconciliation_checks
    );
    if let (Some(technique), Some(bytes)) = (snapshot.applied_technique, snapshot.payload_bytes) {
        let _ = writeln!(out, "  applied via {technique}, {bytes} bytes");
    }
    if let Some(source) = &snapshot.payload_source {
        let _ = writeln!(out, "  source: {source}");
    }
    for failure in &snapshot.last_apply_failures {
        let _ = writeln!(out, "  {}: {}", failure.technique, failure.reason);
    }
    out
}

/// Print a live engine event: one JSON line, or a log line.
pub fn print_event(event: &EngineEvent, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }
    if is_notable(event) {
        tracing::info!("{}", describe_event(event));
    } else {
        tracing::debug!("{}", describe_event(event));
    }
    Ok(())
}

pub fn describe_event(event: &EngineEvent) -> String {
    match event {
        EngineEvent::FetchSucceeded {
            strategy,
            source,
            bytes,
            attempts,
            ..
        } => format!("Fetched {bytes} bytes via {strategy} from {source} ({attempts} attempts)"),
        EngineEvent::FetchFailed { reason, .. } => format!("Fetch failed: {reason}"),
        EngineEvent::Applied {
            technique,
            from_cache,
            weak,
            ..
        } => format!(
            "Applied via {technique}{}{}",
            if *from_cache { " from cache" } else { "" },
            if *weak { " (unverified rules)" } else { "" }
        ),
        EngineEvent::ApplyFailed { reason, .. } => format!("Apply failed: {reason}"),
        EngineEvent::Removed { .. } => "Removed".to_string(),
        EngineEvent::ReapplyTriggered { reason, .. } => format!("Re-applying ({reason:?})"),
        EngineEvent::WatchStarted { mode, .. } => format!("Watching ({mode:?})"),
        EngineEvent::WatchStopped { .. } => "Stopped watching".to_string(),
        EngineEvent::ReconciliationBoundExceeded { checks, .. } => {
            format!("Stopped polling after {checks} checks")
        }
        EngineEvent::RetryExhausted {
            attempts,
            last_error,
            ..
        } => format!("Gave up after {attempts} attempts: {last_error}"),
        EngineEvent::EnabledChanged { enabled, .. } => {
            if *enabled { "Enabled" } else { "Disabled" }.to_string()
        }
    }
}

fn format_age(secs: u64) -> String {
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s => format!("{}h{}m", s / 3600, (s % 3600) / 60),
    }
}
