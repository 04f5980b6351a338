//! Operator console on stdin.

use runhub_core::Hub;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    Sessions,
    Programs,
    Executions,
    Help,
    Exit,
    Unknown(String),
}

impl ConsoleCommand {
    pub fn parse(line: &str) -> Option<Self> {
        let word = line.split_whitespace().next()?;
        Some(match word {
            "sessions" | "listSession" => ConsoleCommand::Sessions,
            "programs" => ConsoleCommand::Programs,
            "executions" => ConsoleCommand::Executions,
            "help" => ConsoleCommand::Help,
            "exit" | "quit" => ConsoleCommand::Exit,
            other => ConsoleCommand::Unknown(other.to_string()),
        })
    }
}

pub fn render(hub: &Hub, command: &ConsoleCommand) -> String {
    match command {
        ConsoleCommand::Sessions => {
            let mut out = String::from("Session\t\t\tListener\tRemoteAddr\n");
            for session in hub.sessions().snapshot() {
                out.push_str(&format!(
                    "{}\t{}\t\t{}\n",
                    session.id, session.listener, session.peer
                ));
            }
            out
        }
        ConsoleCommand::Programs => {
            let mut out = String::from("Program\t\tLanguage\tImmediate\n");
            for program in hub.registry().snapshot() {
                out.push_str(&format!(
                    "{}\t{}\t\t{}\n",
                    program.id,
                    program.language.name(),
                    program.immediate
                ));
            }
            out
        }
        ConsoleCommand::Executions => {
            let mut out = String::from("Execution\tProgram\t\tStarted\n");
            for execution in hub.orchestrator().snapshot() {
                out.push_str(&format!(
                    "{}\t{}\t{}\n",
                    execution.id,
                    execution.program,
                    execution.started_at.format("%Y-%m-%d %H:%M:%S")
                ));
            }
            out
        }
        ConsoleCommand::Help => "Commands: sessions, programs, executions, exit\n".to_string(),
        ConsoleCommand::Exit => String::new(),
        ConsoleCommand::Unknown(word) => format!("Unknown command: {}\n", word),
    }
}

/// Serves console commands until `exit`. A closed stdin leaves the daemon running.
pub async fn run(hub: Arc<Hub>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                log::debug!("stdin closed, console disabled");
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                log::warn!("Console read failed: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };
        let Some(command) = ConsoleCommand::parse(&line) else {
            continue;
        };
        if command == ConsoleCommand::Exit {
            return;
        }
        print!("{}", render(&hub, &command));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runhub_core::config::HubConfig;
    use runhub_core::{MemoryRuntime, ToolchainBuilder};

    #[test]
    fn test_parse_commands() {
        assert_eq!(ConsoleCommand::parse("  sessions "), Some(ConsoleCommand::Sessions));
        assert_eq!(ConsoleCommand::parse("exit"), Some(ConsoleCommand::Exit));
        assert_eq!(
            ConsoleCommand::parse("reboot now"),
            Some(ConsoleCommand::Unknown("reboot".to_string()))
        );
        assert_eq!(ConsoleCommand::parse("   "), None);
    }

    #[tokio::test]
    async fn test_render_empty_tables() {
        let store = tempfile::tempdir().unwrap();
        let mut config = HubConfig::default();
        config.storage.program_dir = store.path().to_path_buf();
        let runtime: Arc<dyn runhub_core::ContainerRuntime> = Arc::new(MemoryRuntime::new());
        let builder = Arc::new(ToolchainBuilder::new(
            Arc::clone(&runtime),
            config.runtime.clone(),
            config.build.clone(),
        ));
        let hub = Hub::new(config, "secret".to_string(), runtime, builder)
            .await
            .unwrap();

        assert!(render(&hub, &ConsoleCommand::Programs).starts_with("Program"));
        assert_eq!(render(&hub, &ConsoleCommand::Sessions).lines().count(), 1);
        assert!(render(&hub, &ConsoleCommand::Unknown("x".into())).contains("Unknown"));
    }
}
