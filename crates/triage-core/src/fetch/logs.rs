//! Container log excerpts.
//!
//! Log groups are found by prefix (`/ecs/<cluster>/<app>` unless the request
//! overrides it). When the task fetcher ran first, the search narrows to the
//! streams of the tasks it identified, stopped tasks first.

use std::collections::BTreeMap;

use async_trait::async_trait;
use cluster_probe::{LogEvent, LogQuery};

use super::{FetchContext, FetchOutcome, Fetcher};
use crate::domain::{Evidence, EvidenceSource, FetchError, Finding, Severity};

const SOURCE: EvidenceSource = EvidenceSource::Logs;

/// Tasks whose streams are searched when task hints are available.
const MAX_HINTED_TASKS: usize = 5;

/// Characters of a message used to group repeated errors.
const PATTERN_PREFIX_CHARS: usize = 50;

#[derive(Debug, Clone, Copy, Default)]
pub struct LogsFetcher;

/// Severity of a log line, read from its text.
pub fn classify_log_line(message: &str) -> Severity {
    let upper = message.to_ascii_uppercase();
    if upper.contains("ERROR") || upper.contains("EXCEPTION") || upper.contains("FAIL") {
        Severity::Error
    } else if upper.contains("WARN") {
        Severity::Warning
    } else {
        Severity::Info
    }
}

#[async_trait]
impl Fetcher for LogsFetcher {
    fn source(&self) -> EvidenceSource {
        SOURCE
    }

    async fn fetch(&self, ctx: &FetchContext) -> Result<FetchOutcome, FetchError> {
        let mut out = ctx.outcome();
        let prefix = ctx
            .param("log_group_prefix")
            .map(str::to_string)
            .unwrap_or_else(|| ctx.target.log_group_prefix());
        let api = &ctx.collaborators.logs;

        let mut groups = ctx
            .controls
            .collect_pages("logs:DescribeLogGroups", |token| {
                api.describe_log_groups(&prefix, token)
            })
            .await;
        out.absorb_collected(SOURCE, "logs:DescribeLogGroups", &mut groups);
        if groups.items.is_empty() {
            if out.warnings.is_empty() && out.evidence.is_empty() {
                out.push(Evidence::new(
                    SOURCE,
                    Severity::Warning,
                    Finding::LogGroupsMissing {
                        prefix: prefix.clone(),
                    },
                    format!("no log groups match {prefix}"),
                ));
            }
            return Ok(out);
        }

        let streams: Vec<Option<String>> = match ctx.param("task_id") {
            Some(task_id) => vec![Some(task_id.to_string())],
            None if !ctx.task_hints.is_empty() => {
                let mut hinted: Vec<_> = ctx.task_hints.iter().collect();
                hinted.sort_by_key(|h| !h.stopped);
                hinted
                    .into_iter()
                    .take(MAX_HINTED_TASKS)
                    .map(|h| Some(h.task_id.clone()))
                    .collect()
            }
            None => vec![None],
        };
        let pattern = ctx.param("filter_pattern").map(str::to_string);

        let mut lines: Vec<(String, LogEvent)> = Vec::new();
        for group in &groups.items {
            for stream in &streams {
                let query = LogQuery {
                    group: group.clone(),
                    start: ctx.window.start(),
                    end: ctx.window.end(),
                    pattern: pattern.clone(),
                    stream_contains: stream.clone(),
                };
                let mut events = ctx
                    .controls
                    .collect_pages("logs:FilterLogEvents", |token| {
                        api.filter_log_events(&query, token)
                    })
                    .await;
                out.absorb_collected(SOURCE, "logs:FilterLogEvents", &mut events);
                lines.extend(events.items.into_iter().map(|e| (group.clone(), e)));
            }
        }

        let scanned = lines.len() as u32;
        let mut errors = 0u32;
        let mut warnings = 0u32;
        let mut patterns: BTreeMap<String, u32> = BTreeMap::new();
        let mut excerpts = Vec::new();
        for (group, event) in lines {
            let severity = classify_log_line(&event.message);
            match severity {
                Severity::Error => {
                    errors += 1;
                    let key: String = event.message.chars().take(PATTERN_PREFIX_CHARS).collect();
                    *patterns.entry(key).or_insert(0) += 1;
                }
                Severity::Warning => warnings += 1,
                Severity::Info => continue,
            }
            excerpts.push(
                Evidence::new(
                    SOURCE,
                    severity,
                    Finding::LogLine {
                        group,
                        stream: event.stream.clone(),
                    },
                    event.message.trim_end().to_string(),
                )
                .with_timestamp(event.timestamp),
            );
        }

        // Newest excerpts win when over the cap.
        excerpts.sort_by_key(|e| e.timestamp());
        let dropped = excerpts.len().saturating_sub(ctx.max_log_lines);
        for excerpt in excerpts.into_iter().skip(dropped) {
            out.push(excerpt);
        }

        let mut top: Vec<(String, u32)> = patterns.into_iter().collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(5);
        let top: Vec<_> = top
            .into_iter()
            .map(|(pattern, count)| serde_json::json!({"pattern": pattern, "count": count}))
            .collect();

        out.push(
            Evidence::new(
                SOURCE,
                if errors > 0 {
                    Severity::Warning
                } else {
                    Severity::Info
                },
                Finding::LogSummary {
                    scanned,
                    errors,
                    warnings,
                },
                format!(
                    "scanned {scanned} log line(s) in {} group(s): {errors} error(s), {warnings} warning(s)",
                    groups.items.len()
                ),
            )
            .with_raw("error_patterns", top)
            .with_raw("excerpts_dropped", dropped),
        );

        Ok(out.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_log_line() {
        assert_eq!(classify_log_line("ERROR connection refused"), Severity::Error);
        assert_eq!(
            classify_log_line("java.lang.NullPointerException at Foo"),
            Severity::Error
        );
        assert_eq!(classify_log_line("health check failed"), Severity::Error);
        assert_eq!(classify_log_line("[warn] slow query"), Severity::Warning);
        assert_eq!(classify_log_line("listening on :8080"), Severity::Info);
    }
}
