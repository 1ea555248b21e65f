//! Operator interaction.
//!
//! Interactive runs ask the human through a terminal select; unattended
//! runs consult a configured default answer and fail fast when a mandatory
//! prompt has none.

use anyhow::{bail, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Answer {
    Yes,
    No,
    Quit,
}

impl Answer {
    fn label(self) -> &'static str {
        match self {
            Answer::Yes => "yes",
            Answer::No => "no",
            Answer::Quit => "quit",
        }
    }
}

pub trait Prompter {
    /// Present `question` with enumerated answers and block until one is
    /// chosen. `quit_enabled` adds the quit option.
    fn ask(&self, question: &str, quit_enabled: bool) -> Result<Answer>;

    fn confirm(&self, question: &str) -> Result<bool> {
        Ok(self.ask(question, false)? == Answer::Yes)
    }

    fn is_interactive(&self) -> bool;
}

/// Terminal prompter used in interactive mode.
pub struct ConsolePrompter;

impl Prompter for ConsolePrompter {
    fn ask(&self, question: &str, quit_enabled: bool) -> Result<Answer> {
        let options = if quit_enabled {
            vec!["yes", "no", "quit"]
        } else {
            vec!["yes", "no"]
        };
        let choice = inquire::Select::new(question, options).prompt()?;
        Ok(match choice {
            "yes" => Answer::Yes,
            "no" => Answer::No,
            _ => Answer::Quit,
        })
    }

    fn is_interactive(&self) -> bool {
        true
    }
}

/// Prompter for unattended runs. Every question is answered with the
/// configured default, or the run fails if none was configured.
pub struct UnattendedPrompter {
    default: Option<Answer>,
}

impl UnattendedPrompter {
    pub fn new(assume_yes: bool) -> Self {
        Self {
            default: assume_yes.then_some(Answer::Yes),
        }
    }
}

impl Prompter for UnattendedPrompter {
    fn ask(&self, question: &str, _quit_enabled: bool) -> Result<Answer> {
        match self.default {
            Some(answer) => {
                println!("{question} {}", answer.label());
                Ok(answer)
            }
            None => bail!(
                "unattended mode reached the prompt '{question}' without a default answer; \
                 pass --yes to confirm prompts automatically"
            ),
        }
    }

    fn is_interactive(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unattended_uses_configured_default() {
        let prompter = UnattendedPrompter::new(true);
        assert_eq!(prompter.ask("proceed?", true).unwrap(), Answer::Yes);
        assert!(prompter.confirm("proceed?").unwrap());
    }

    #[test]
    fn unattended_fails_without_default() {
        let prompter = UnattendedPrompter::new(false);
        let err = prompter.ask("proceed?", false).unwrap_err();
        assert!(err.to_string().contains("--yes"));
    }
}
