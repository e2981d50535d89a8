//! Permission prompts for the relay.

use async_trait::async_trait;
use conduit_core::permissions::{PromptRequest, UserPrompt};
use conduit_core::{ConduitError, Result};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::info;

/// Answers every prompt the same way without asking anyone.
pub struct StaticPrompt {
    grant: bool,
}

impl StaticPrompt {
    pub fn new(grant: bool) -> Self {
        Self { grant }
    }
}

#[async_trait]
impl UserPrompt for StaticPrompt {
    async fn prompt(&self, request: PromptRequest) -> Result<bool> {
        info!(
            "Automatically {} client {}",
            if self.grant { "granting" } else { "rejecting" },
            request.origin
        );
        Ok(self.grant)
    }
}

/// Asks the operator on the terminal, one client at a time.
pub struct ConsolePrompt {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

#[async_trait]
impl UserPrompt for ConsolePrompt {
    async fn prompt(&self, request: PromptRequest) -> Result<bool> {
        let mut lines = self.lines.lock().await;
        eprintln!("{}", question(&request));

        match lines.next_line().await? {
            Some(answer) => Ok(is_yes(&answer)),
            None => Err(ConduitError::Other(
                "the terminal was closed before answering".to_string(),
            )),
        }
    }

    async fn cancel(&self, origin: &str) {
        eprintln!("Client {} was allowed by the policy; no answer is needed.", origin);
    }
}

fn question(request: &PromptRequest) -> String {
    let who = if request.is_client_known {
        format!("\"{}\" ({})", request.client_name, request.origin)
    } else {
        format!("an unknown client {} ({})", request.client_name, request.origin)
    };
    format!(
        "Allow {} to use the server? More info: {}\n[y/N]: ",
        who, request.client_info_link
    )
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
