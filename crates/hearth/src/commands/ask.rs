//! Ask command - one-shot question to the assistant.

use std::io::Write;
use std::sync::Arc;

use anyhow::Result;
use clap::Args;
use console::Style;
use futures::StreamExt;

use hearth_agent::{AgentEvent, ConversationId, ToolRegistry, TurnOutcome};
use hearth_llm::Message;

use super::Context;
use crate::gateway;

/// Arguments for the ask command.
#[derive(Args, Debug)]
pub struct AskArgs {
    /// The question or prompt to send
    #[arg(required = true)]
    pub prompt: String,

    /// Show internal reasoning on stderr
    #[arg(long)]
    pub show_reasoning: bool,
}

/// Run the ask command.
pub async fn run(args: AskArgs, ctx: &Context) -> Result<()> {
    let loaded = ctx.load_config()?;
    let config = &loaded.config;

    let lookup = |var: &str| std::env::var(var).ok();
    let invoker = gateway::build_invoker(config, &lookup)?;
    let orchestrator = Arc::new(gateway::build_orchestrator(
        config,
        invoker,
        ToolRegistry::new(),
    ));

    let conversation = ConversationId::new();
    let dim = Style::new().dim();
    if ctx.verbose {
        eprintln!("{}", dim.apply_to(format!("Conversation: {}", conversation)));
    }

    let (mut stream, handle) = orchestrator.stream(
        vec![Message::user(args.prompt)],
        conversation.call_context("assistant"),
    );

    // Track if we've printed anything (for final newline)
    let mut has_output = false;

    while let Some(event) = stream.next().await {
        match event {
            AgentEvent::Token { text } => {
                print!("{}", text);
                std::io::stdout().flush()?;
                has_output = true;
            }
            AgentEvent::Internal { text } => {
                if args.show_reasoning {
                    eprint!("{}", dim.apply_to(text));
                }
            }
            AgentEvent::ToolStart { name } => {
                eprintln!("{}", dim.apply_to(format!("[Running: {}]", name)));
            }
            AgentEvent::ToolEnd {
                name,
                result_summary,
            } => {
                eprintln!(
                    "{}",
                    dim.apply_to(format!("[{} done: {}]", name, result_summary))
                );
            }
            AgentEvent::ApprovalRequired { description } => {
                let yellow = Style::new().yellow();
                eprintln!("{}", yellow.apply_to("Approval required:"));
                eprintln!("{}", description);
            }
            AgentEvent::State { .. } => {}
        }
    }

    if has_output {
        println!();
    }

    let turn = match handle.await? {
        Ok(turn) => turn,
        Err(e) => {
            let red = Style::new().red();
            eprintln!("{} {}", red.apply_to("Error:"), e);
            return Err(e.into());
        }
    };

    if let TurnOutcome::Answer {
        truncated: true, ..
    } = turn.outcome
    {
        tracing::warn!(
            iterations = turn.iterations,
            "Turn stopped at the tool iteration limit"
        );
    }

    Ok(())
}
