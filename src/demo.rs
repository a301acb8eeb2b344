//! Scripted agent for `seeker serve --demo`
//!
//! Walks a small shell-assistant script: every command needs approval before
//! it "runs", and some steps ask the human for text. After each turn the
//! agent reports whether tools ran and waits for an observer to nudge it on.

use anyhow::{bail, Result};
use console::Style;
use serde_json::json;
use std::sync::Arc;

use seeker_core::{HumanGate, RunningServer, SeekerError};

enum Step {
    Command(&'static str),
    Ask(&'static str),
}

const SCRIPT: &[Step] = &[
    Step::Ask("What should I work on?"),
    Step::Command("git status --short"),
    Step::Command("cargo test --workspace"),
    Step::Ask("Commit message for these changes?"),
    Step::Command("git commit -am \"$MESSAGE\""),
    Step::Command("rm -rf target/"),
];

pub async fn run(server: &mut RunningServer) -> Result<()> {
    let gate: Arc<dyn HumanGate> = Arc::new(server.requester());
    let cyan = Style::new().cyan();
    let dim = Style::new().dim();

    for (turn, step) in SCRIPT.iter().cycle().enumerate() {
        let tool_activity = match take_step(gate.as_ref(), step).await {
            Ok(ran) => ran,
            Err(e) if e.is_fatal() => bail!("agent halted: {e}"),
            Err(e) => {
                tracing::warn!(error = %e, "demo step failed");
                false
            }
        };

        server.fanout.turn_completed(tool_activity);
        println!(
            "{} turn {} done, waiting for a nudge",
            cyan.apply_to("agent"),
            turn + 1
        );
        match server.next_nudge().await {
            Some(observer) => println!("{}", dim.apply_to(format!("nudged by observer {observer}"))),
            None => break,
        }
    }
    Ok(())
}

/// Returns whether a tool ran
async fn take_step(gate: &dyn HumanGate, step: &Step) -> Result<bool, SeekerError> {
    let green = Style::new().green();
    let red = Style::new().red();

    match step {
        Step::Ask(prompt) => {
            let answer = gate.request_input(prompt).await?;
            println!("{} {prompt} -> {answer}", Style::new().cyan().apply_to("agent"));
            Ok(false)
        }
        Step::Command(command) => {
            let approval = gate
                .request_approval(
                    &format!("Run `{command}`?"),
                    json!({ "tool": "execute_command", "args": { "command": command } }),
                )
                .await?;
            if approval.is_granted() {
                println!("{} {command}", green.apply_to("would run"));
                Ok(true)
            } else {
                println!("{} {command} ({approval:?})", red.apply_to("skipped"));
                Ok(false)
            }
        }
    }
}
