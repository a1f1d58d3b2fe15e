//! User confirmation prompts
//!
//! Every "are you sure?" question goes through [`Confirm`]. Non-interactive
//! runs (the RPC worker, CI) use [`AutoAnswer`], which answers with the
//! prompt's default unless forced.

use std::io::{BufRead, IsTerminal, Write};

use tracing::info;

/// Asks the operator a yes/no question
#[cfg_attr(any(test, feature = "testing"), mockall::automock)]
pub trait Confirm: Send + Sync {
    /// Ask `message`; `yes_by_default` is the answer on empty input
    fn ask(&self, message: &str, yes_by_default: bool) -> bool;
}

/// Answers without asking
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAnswer {
    forced: Option<bool>,
}

impl AutoAnswer {
    /// Answer every prompt with its default
    pub fn defaults() -> Self {
        Self { forced: None }
    }

    /// Answer every prompt with yes
    pub fn yes() -> Self {
        Self { forced: Some(true) }
    }

    /// Answer every prompt with no
    pub fn no() -> Self {
        Self { forced: Some(false) }
    }
}

impl Confirm for AutoAnswer {
    fn ask(&self, message: &str, yes_by_default: bool) -> bool {
        let answer = self.forced.unwrap_or(yes_by_default);
        info!(question = %message, answer, "Confirmation answered automatically");
        answer
    }
}

/// Prompts on the controlling terminal; falls back to the default when
/// stdin is not a terminal
#[derive(Debug, Clone, Copy, Default)]
pub struct TerminalPrompt;

fn parse_answer(line: &str, yes_by_default: bool) -> Option<bool> {
    match line.trim().to_ascii_lowercase().as_str() {
        "" => Some(yes_by_default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

impl Confirm for TerminalPrompt {
    fn ask(&self, message: &str, yes_by_default: bool) -> bool {
        let stdin = std::io::stdin();
        if !stdin.is_terminal() {
            return AutoAnswer::defaults().ask(message, yes_by_default);
        }

        let hint = if yes_by_default { "[Y/n]" } else { "[y/N]" };
        let mut stdout = std::io::stdout();
        loop {
            // prompt output failures fall back to the default answer
            if write!(stdout, "{message} {hint}: ").and_then(|_| stdout.flush()).is_err() {
                return yes_by_default;
            }
            let mut line = String::new();
            match stdin.lock().read_line(&mut line) {
                Ok(0) | Err(_) => return yes_by_default,
                Ok(_) => {}
            }
            if let Some(answer) = parse_answer(&line, yes_by_default) {
                return answer;
            }
        }
    }
}
