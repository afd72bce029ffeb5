use std::path::Path;

use flowchat_core::config::{AppConfig, TelemetryBackend};
use flowchat_engine::{FlowGraph, Severity};

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

impl CheckResult {
    fn ok(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: true,
            detail: detail.into(),
        }
    }

    fn fail(label: &str, detail: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ok: false,
            detail: detail.into(),
        }
    }
}

pub async fn run_doctor(config: &AppConfig, config_path: Option<&Path>) {
    let checks = vec![
        check_config_file(config_path),
        check_workspace(config),
        check_flow(config).await,
        check_telemetry(config),
        check_retry(config),
        check_transcripts(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_config_file(path: Option<&Path>) -> CheckResult {
    match path {
        Some(p) => CheckResult::ok("Config", p.display().to_string()),
        None => CheckResult::ok("Config", "No config file, using defaults"),
    }
}

fn check_workspace(config: &AppConfig) -> CheckResult {
    let ws = config.workspace_dir();
    if !ws.is_dir() {
        return CheckResult::fail("Workspace", format!("{} (does not exist)", ws.display()));
    }
    let test_file = ws.join(".doctor_test");
    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            std::fs::remove_file(&test_file).ok();
            CheckResult::ok("Workspace", ws.display().to_string())
        }
        Err(e) => CheckResult::fail(
            "Workspace",
            format!("{} (not writable: {})", ws.display(), e),
        ),
    }
}

async fn check_flow(config: &AppConfig) -> CheckResult {
    if config.engine.flow.is_none() {
        return CheckResult::ok("Flow", "Not configured (pass --flow to chat)");
    }
    let doc = match crate::load_flow(config, &config.engine.assistant_id, None).await {
        Ok(doc) => doc,
        Err(e) => return CheckResult::fail("Flow", e.to_string()),
    };

    let graph = FlowGraph::new(doc);
    let issues = graph.check();
    let errors: Vec<String> = issues
        .iter()
        .filter(|i| i.severity() == Severity::Error)
        .map(|i| i.to_string())
        .collect();
    if !errors.is_empty() {
        return CheckResult::fail("Flow", errors.join(", "));
    }
    CheckResult::ok(
        "Flow",
        format!(
            "{} nodes, {} edges, {} warnings",
            graph.nodes().len(),
            graph.edges().len(),
            issues.len()
        ),
    )
}

fn check_telemetry(config: &AppConfig) -> CheckResult {
    let telemetry = &config.telemetry;
    match telemetry.backend {
        TelemetryBackend::Log | TelemetryBackend::None => {
            CheckResult::ok("Telemetry", telemetry.backend.as_str())
        }
        TelemetryBackend::Sqlite => {
            let db_path = config.db_path();
            match flowchat_telemetry::SqliteTelemetry::open(&db_path) {
                Ok(_) => CheckResult::ok("Telemetry", format!("sqlite {}", db_path.display())),
                Err(e) => CheckResult::fail("Telemetry", format!("{}: {}", db_path.display(), e)),
            }
        }
        TelemetryBackend::Http => match &telemetry.base_url {
            None => CheckResult::fail("Telemetry", "http backend without base_url"),
            Some(url) if !url.starts_with("http://") && !url.starts_with("https://") => {
                CheckResult::fail("Telemetry", format!("base_url '{}' is not an http(s) URL", url))
            }
            Some(_) if telemetry.api_key.as_deref().is_some_and(|k| k.starts_with("${")) => {
                CheckResult::fail("Telemetry", "api_key references an unset environment variable")
            }
            Some(url) => CheckResult::ok("Telemetry", format!("http {}", url)),
        },
    }
}

fn check_retry(config: &AppConfig) -> CheckResult {
    let retry = &config.telemetry.retry;
    if retry.max_backoff_ms < retry.initial_backoff_ms {
        CheckResult::fail(
            "Retry",
            format!(
                "max_backoff_ms ({}) < initial_backoff_ms ({})",
                retry.max_backoff_ms, retry.initial_backoff_ms
            ),
        )
    } else {
        CheckResult::ok(
            "Retry",
            format!(
                "{} retries, {}..{} ms backoff",
                retry.max_retries, retry.initial_backoff_ms, retry.max_backoff_ms
            ),
        )
    }
}

fn check_transcripts(config: &AppConfig) -> CheckResult {
    let Some(dir) = config.log_dir() else {
        return CheckResult::ok("Transcripts", "Disabled");
    };
    let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
    if !(1..=3).contains(&level) {
        return CheckResult::fail("Transcripts", format!("level {} (expected 1-3)", level));
    }
    match std::fs::create_dir_all(&dir) {
        Ok(_) => CheckResult::ok("Transcripts", format!("{} (level {})", dir.display(), level)),
        Err(e) => CheckResult::fail("Transcripts", format!("{}: {}", dir.display(), e)),
    }
}
