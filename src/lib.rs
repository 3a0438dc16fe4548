pub mod commands;
pub mod config;
pub mod db;
pub mod error;
pub mod llm;
pub mod logging;
pub mod remote;
pub mod session;
pub mod view;

use anyhow::Context;
use commands::{Command, Flow, Shell, HELP};
use config::Config;
use remote::LocalRemote;
use session::SessionController;
use std::io::Write as _;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

fn prompt(shell: &Shell) -> String {
    match shell.controller().view().user {
        Some(user) => format!("{}> ", user.name),
        None => "> ".to_string(),
    }
}

fn print_flush(text: &str) -> anyhow::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(text.as_bytes())?;
    stdout.flush()?;
    Ok(())
}

/// Opens the store, wires the session and runs the line-oriented chat loop
/// until `/quit` or end of input.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let remote = LocalRemote::open(&config.database_path).with_context(|| {
        format!("failed to open database at {}", config.database_path.display())
    })?;
    let db = Arc::clone(remote.database());
    info!(path = %config.database_path.display(), "database ready");

    let gateway = config.inference_gateway(&db);
    let controller = SessionController::new(Arc::new(remote), Arc::new(gateway));
    controller.watch_auth();
    let shell = Shell::new(controller, db);

    print_flush(&format!("AI Chatbot\n{}\n\n", HELP))?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_flush(&prompt(&shell))?;
        let Some(line) = lines.next_line().await.context("failed to read input")? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let output = match line.parse::<Command>() {
            Ok(command) => match shell.execute(command).await {
                Flow::Continue(output) => output,
                Flow::Quit => break,
            },
            Err(e) => format!("! {}\n", e),
        };
        print_flush(&output)?;
    }
    Ok(())
}
