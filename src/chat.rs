use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use flowchat_core::config::{AppConfig, PacingConfig};
use flowchat_core::error::FlowError;
use flowchat_core::flow::{ChoiceOption, Element, ElementKind, FieldKind, FormField};
use flowchat_core::types::{EngineEvent, Response};
use flowchat_engine::{
    ConversationDriver, ConversationHandle, CoordinatorSettings, FlowGraph, ResponseOutcome,
    TranscriptLogger,
};

/// Where the conversation stopped for the visitor.
enum Pause {
    Awaiting(Element),
    Ended,
    Closed,
}

/// One line of visitor input.
enum Line {
    Command(String),
    Answer(Response),
    Eof,
}

pub struct ChatOptions {
    pub flow: Option<String>,
    pub assistant: Option<String>,
    pub instant: bool,
}

pub async fn run_chat(config: &AppConfig, options: ChatOptions) -> anyhow::Result<()> {
    let mut settings = CoordinatorSettings::from_config(config);
    if let Some(assistant) = options.assistant {
        settings.assistant_id = assistant;
    }
    if options.instant {
        settings.pacing = PacingConfig::instant();
    }

    let doc = match crate::load_flow(config, &settings.assistant_id, options.flow.as_deref()).await
    {
        Ok(doc) => doc,
        Err(e) => {
            println!("bot> {}", config.messages.start_failed);
            return Err(e);
        }
    };
    let graph = Arc::new(FlowGraph::new(doc));
    for issue in graph.check() {
        warn!(issue = %issue, "Flow check");
    }

    let telemetry = flowchat_telemetry::from_config(config)?;
    let (driver, handle) = ConversationDriver::build(
        Arc::clone(&graph),
        telemetry,
        settings.clone(),
        config.telemetry.retry.clone(),
    );
    let mut events = handle.subscribe();

    let logger_task = config.log_dir().map(|dir| {
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        TranscriptLogger::new(dir, level).spawn(
            handle.event_bus(),
            &settings.assistant_id,
            CancellationToken::new(),
        )
    });
    let task = driver.spawn();

    println!("flowchat v{}", env!("CARGO_PKG_VERSION"));
    println!(
        "Flow: {} ({} nodes)",
        graph.name().unwrap_or("unnamed"),
        graph.nodes().len()
    );
    println!("Type /help for commands, /quit to exit.\n");

    let result = repl(&handle, &mut events).await;

    // Leaving abandons the session; the backend sees it ended.
    handle.reset().await.ok();
    handle.shutdown();
    task.await.ok();
    drop(events);
    drop(handle);
    if let Some(logger) = logger_task {
        logger.await.ok();
    }
    result
}

async fn repl(
    handle: &ConversationHandle,
    events: &mut broadcast::Receiver<EngineEvent>,
) -> anyhow::Result<()> {
    let mut pause = wait_for_pause(events).await;

    loop {
        if matches!(pause, Pause::Closed) {
            break;
        }

        match next_line(&pause)? {
            Line::Eof => break,
            Line::Command(cmd) => match cmd.split_whitespace().next().unwrap_or("") {
                "/quit" | "/exit" | "/q" => {
                    println!("Goodbye!");
                    break;
                }
                "/reset" | "/restart" => {
                    println!("[restarting]");
                    if let Err(e) = handle.restart().await {
                        debug!(error = %e, "Restart failed");
                    }
                    pause = wait_for_pause(events).await;
                }
                "/state" => {
                    let snapshot = handle.snapshot().await?;
                    println!("State: {}", snapshot.state);
                    if let Some(session) = snapshot.session {
                        println!("Session: {} ({})", session.id, session.status.as_str());
                        println!(
                            "Node: {}",
                            session.current_node_id.as_deref().unwrap_or("-")
                        );
                    }
                    if let Some(element) = snapshot.awaiting {
                        println!("Waiting on: {} ({})", element.id, element.type_name());
                    }
                }
                "/help" => {
                    println!("  <number>   pick an option");
                    println!("  <text>     type an answer");
                    println!("  /state     show conversation state");
                    println!("  /reset     start over");
                    println!("  /quit      leave");
                }
                other => println!("Unknown command: {}. Try /help.", other),
            },
            Line::Answer(response) => {
                if !matches!(pause, Pause::Awaiting(_)) {
                    println!("[conversation ended: /reset to start over, /quit to leave]");
                    continue;
                }
                match handle.respond(response).await {
                    Ok(ResponseOutcome::Advanced { .. }) => {
                        pause = wait_for_pause(events).await;
                    }
                    Ok(ResponseOutcome::Unmatched) => {
                        drain(events);
                    }
                    Ok(ResponseOutcome::Ended) => {
                        pause = drain(events).unwrap_or(Pause::Ended);
                    }
                    Err(FlowError::InvalidInput(e)) => {
                        drain(events);
                        println!("[{}]", e);
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
    Ok(())
}

/// Print events until the conversation needs the visitor again.
async fn wait_for_pause(events: &mut broadcast::Receiver<EngineEvent>) -> Pause {
    loop {
        match events.recv().await {
            Ok(event) => {
                if let Some(pause) = render(&event) {
                    return pause;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Chat display lagged");
            }
            Err(broadcast::error::RecvError::Closed) => return Pause::Closed,
        }
    }
}

/// Print what is already queued.
fn drain(events: &mut broadcast::Receiver<EngineEvent>) -> Option<Pause> {
    let mut pause = None;
    while let Ok(event) = events.try_recv() {
        if let Some(p) = render(&event) {
            pause = Some(p);
        }
    }
    pause
}

fn render(event: &EngineEvent) -> Option<Pause> {
    match event {
        EngineEvent::Revealed { element, .. } => {
            print_element(element);
            None
        }
        EngineEvent::AwaitingInput { element, .. } => Some(Pause::Awaiting(element.clone())),
        EngineEvent::Unmatched { message, .. } => {
            println!("bot> {}", message);
            None
        }
        EngineEvent::Ended { message, .. } => {
            if let Some(message) = message {
                println!("bot> {}", message);
            }
            println!("[conversation ended: /reset to start over, /quit to leave]");
            Some(Pause::Ended)
        }
        EngineEvent::Fatal { error, message } => {
            println!("bot> {}", message);
            eprintln!("[error: {}]", error);
            Some(Pause::Ended)
        }
        EngineEvent::SessionStarted { session_id, .. } => {
            debug!(session_id = %session_id, "Chat session started");
            None
        }
        _ => None,
    }
}

fn print_element(element: &Element) {
    let content = element.content.trim();
    match &element.kind {
        ElementKind::Media { media_kind, url } => {
            println!("bot> [{}] {}", media_kind.as_str(), url.as_deref().unwrap_or("-"));
            if !content.is_empty() {
                println!("     {}", content);
            }
        }
        ElementKind::Question { options } => {
            if !content.is_empty() {
                println!("bot> {}", content);
            }
            for (i, option) in options.iter().enumerate() {
                println!("  {}) {}", i + 1, option.text);
            }
        }
        ElementKind::Form { description, .. } => {
            if !content.is_empty() {
                println!("bot> {}", content);
            }
            if let Some(description) = description.as_deref().filter(|d| !d.trim().is_empty()) {
                println!("     {}", description);
            }
        }
        _ => {
            if !content.is_empty() {
                println!("bot> {}", content);
            }
        }
    }
}

fn next_line(pause: &Pause) -> io::Result<Line> {
    if let Pause::Awaiting(element) = pause {
        if let ElementKind::Form { fields, .. } = &element.kind {
            return collect_form(fields);
        }
    }

    let Some(input) = read_prompt("> ")? else {
        return Ok(Line::Eof);
    };
    if input.starts_with('/') {
        return Ok(Line::Command(input));
    }
    if input.is_empty() {
        return next_line(pause);
    }
    let response = match pause {
        Pause::Awaiting(element) => match &element.kind {
            ElementKind::Question { options } => parse_choice(&input, options),
            _ => Response::text(input),
        },
        _ => Response::text(input),
    };
    Ok(Line::Answer(response))
}

/// A number picks the option at that position; anything else is typed text.
fn parse_choice(input: &str, options: &[ChoiceOption]) -> Response {
    match input.trim().parse::<usize>() {
        Ok(n) if (1..=options.len()).contains(&n) => Response::choice(options[n - 1].text.clone()),
        _ => Response::text(input),
    }
}

/// Ask for each field in turn. A `/command` abandons the form.
fn collect_form(fields: &[FormField]) -> io::Result<Line> {
    let mut values = BTreeMap::new();
    for field in fields {
        let Some(value) = read_prompt(&format!("  {}: ", field_prompt(field)))? else {
            return Ok(Line::Eof);
        };
        if value.starts_with('/') {
            return Ok(Line::Command(value));
        }
        if !value.is_empty() {
            values.insert(field.name.clone(), value);
        }
    }
    Ok(Line::Answer(Response::Form(values)))
}

fn field_prompt(field: &FormField) -> String {
    let mut prompt = field.label.clone();
    if field.required {
        prompt.push('*');
    }
    if !field.options.is_empty() {
        prompt.push_str(&format!(" [{}]", field.options.join("/")));
    } else if field.kind == FieldKind::Checkbox {
        prompt.push_str(" [yes/no]");
    }
    prompt
}

fn read_prompt(prompt: &str) -> io::Result<Option<String>> {
    let mut stdout = io::stdout();
    print!("{}", prompt);
    stdout.flush()?;

    let mut input = String::new();
    if io::stdin().lock().read_line(&mut input)? == 0 {
        return Ok(None);
    }
    Ok(Some(input.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_picks_option() {
        let options = vec![ChoiceOption::new("Yes"), ChoiceOption::new("No")];
        assert_eq!(parse_choice("2", &options), Response::choice("No"));
        assert_eq!(parse_choice("3", &options), Response::text("3"));
        assert_eq!(parse_choice("0", &options), Response::text("0"));
        assert_eq!(parse_choice("yes", &options), Response::text("yes"));
    }

    #[test]
    fn test_field_prompt() {
        let plan = FormField::new("plan", "Plan", FieldKind::Select)
            .required()
            .with_options(vec!["basic".into(), "pro".into()]);
        assert_eq!(field_prompt(&plan), "Plan* [basic/pro]");

        let news = FormField::new("news", "Newsletter", FieldKind::Checkbox);
        assert_eq!(field_prompt(&news), "Newsletter [yes/no]");
    }
}
