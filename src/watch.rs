//! Terminal observer for `seeker watch`
//!
//! Shows one request at a time with dialoguer prompts. Prompts block on
//! stdin, so each runs on the blocking pool; a request settled elsewhere
//! while its prompt is open is reported and the late answer is dropped by
//! the client.

use anyhow::{Context, Result};
use console::Style;
use dialoguer::{theme::ColorfulTheme, Input, Select};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use seeker_core::client::{ClientEvent, Reply};
use seeker_core::config::SeekerConfig;
use seeker_core::{ObserverClient, Request, RequestId, RequestKind, Response};

type PromptTask = (RequestId, JoinHandle<Result<Reply>>);

pub async fn run(config: &SeekerConfig, auto_continue: bool) -> Result<()> {
    let mut client = ObserverClient::new(config.client.clone());
    if auto_continue {
        client = client.with_scheduler(config.scheduler.to_scheduler_config());
    }
    let mut handle = client.spawn(CancellationToken::new());

    let dim = Style::new().dim();
    let yellow = Style::new().yellow();
    println!("{}", dim.apply_to(format!("watching {}", config.client.url)));

    let mut prompt: Option<PromptTask> = None;
    // Shown while a dismissed prompt still holds the terminal
    let mut waiting: Option<Request> = None;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            event = handle.next_event() => {
                let Some(event) = event else { break };
                match event {
                    ClientEvent::Show(request) => {
                        if prompt.is_some() {
                            waiting = Some(request);
                        } else {
                            prompt = Some(open_prompt(request));
                        }
                    }
                    ClientEvent::Dismiss { id } => {
                        if prompt.as_ref().is_some_and(|(active, _)| *active == id) {
                            println!();
                            println!(
                                "{}",
                                yellow.apply_to("Answered elsewhere; press Enter to continue")
                            );
                        }
                        if waiting.as_ref().is_some_and(|r| r.id == id) {
                            waiting = None;
                        }
                    }
                    other => report(&other),
                }
            }
            finished = wait_prompt(&mut prompt) => {
                let (id, reply) = finished;
                prompt = None;
                match reply {
                    Ok(reply) => {
                        if let Err(e) = handle.answer(id, reply) {
                            tracing::warn!(error = %e, "answer not delivered");
                        }
                    }
                    Err(e) => tracing::warn!(request_id = %id, error = %e, "prompt failed"),
                }
                if let Some(request) = waiting.take() {
                    prompt = Some(open_prompt(request));
                }
            }
        }
    }

    println!("{}", dim.apply_to("stopped watching"));
    handle.shutdown().await;
    if holds_stdin(&prompt) {
        // The blocking read cannot be cancelled and would stall runtime teardown
        std::process::exit(0);
    }
    Ok(())
}

/// An unanswered prompt is still blocked on stdin
fn holds_stdin(prompt: &Option<PromptTask>) -> bool {
    prompt.as_ref().is_some_and(|(_, task)| !task.is_finished())
}

fn open_prompt(request: Request) -> PromptTask {
    let id = request.id;
    let task = tokio::task::spawn_blocking(move || ask(&request));
    (id, task)
}

async fn wait_prompt(prompt: &mut Option<PromptTask>) -> (RequestId, Result<Reply>) {
    match prompt {
        Some((id, task)) => {
            let reply = match task.await {
                Ok(reply) => reply,
                Err(e) => Err(e).context("prompt task panicked"),
            };
            (*id, reply)
        }
        None => std::future::pending().await,
    }
}

fn ask(request: &Request) -> Result<Reply> {
    let theme = ColorfulTheme::default();
    let bold = Style::new().bold();
    let dim = Style::new().dim();

    println!();
    println!("{}", bold.apply_to(&request.prompt));
    if !request.payload.is_null() {
        let payload = serde_json::to_string_pretty(&request.payload)?;
        println!("{}", dim.apply_to(payload));
    }
    println!(
        "{}",
        dim.apply_to(format!(
            "{} expires {} (then: {})",
            request.id.short(),
            request.expires_at.format("%H:%M:%S"),
            request.default_response
        ))
    );

    match request.kind {
        RequestKind::Approval => {
            let choice = Select::with_theme(&theme)
                .with_prompt("Approve?")
                .items(&["Approve", "Deny", "Deny with reason"])
                .default(1)
                .interact_opt()?;
            Ok(match choice {
                Some(0) => Reply::Respond(Response::approve()),
                Some(2) => {
                    let reason: String = Input::with_theme(&theme)
                        .with_prompt("Reason")
                        .interact_text()?;
                    Reply::Decline {
                        reason: Some(reason),
                    }
                }
                _ => Reply::Decline { reason: None },
            })
        }
        RequestKind::Input => {
            let value: String = Input::with_theme(&theme)
                .with_prompt("Answer")
                .allow_empty(true)
                .interact_text()?;
            Ok(Reply::Respond(Response::text(value)))
        }
    }
}

fn report(event: &ClientEvent) {
    let dim = Style::new().dim();
    let red = Style::new().red();
    match event {
        ClientEvent::Connected => println!("{}", dim.apply_to("connected")),
        ClientEvent::Synced { pending } => {
            println!("{}", dim.apply_to(format!("{pending} pending")))
        }
        ClientEvent::Disconnected { reason } => {
            println!("{}", red.apply_to(format!("disconnected: {reason}")))
        }
        ClientEvent::Reconnecting { attempt, delay } => println!(
            "{}",
            dim.apply_to(format!("reconnecting in {:.1}s (attempt {attempt})", delay.as_secs_f64()))
        ),
        ClientEvent::Queued { position, .. } => {
            println!("{}", dim.apply_to(format!("+1 queued ({position} waiting)")))
        }
        ClientEvent::Ack {
            accepted: false, ..
        } => println!("{}", red.apply_to("answer not accepted (already settled)")),
        ClientEvent::Rejected { error, .. } => {
            println!("{}", red.apply_to(format!("answer rejected: {error}")))
        }
        ClientEvent::Drained => println!("{}", dim.apply_to("nothing pending")),
        ClientEvent::Nudged => println!("{}", dim.apply_to("nudged the agent")),
        ClientEvent::ServerError { message } => {
            println!("{}", red.apply_to(format!("server error: {message}")))
        }
        ClientEvent::Ack { .. }
        | ClientEvent::TurnCompleted { .. }
        | ClientEvent::Show(_)
        | ClientEvent::Dismiss { .. } => {}
    }
}
