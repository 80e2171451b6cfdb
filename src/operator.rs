//! Operator target selection.
//!
//! The operator browses the classes seen in the current frame, picks a
//! candidate and locks it as the class to follow. Commands arrive on a
//! channel (stdin reader in the daemon) and at most one is applied per
//! control iteration.

use anyhow::{anyhow, Context, Result};
use std::io::BufRead;
use std::str::FromStr;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::thread::JoinHandle;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Advance to the next seen class.
    CycleCandidate,
    /// Zero-based index into the seen classes.
    SelectCandidate(usize),
    Lock,
    Clear,
    Quit,
}

impl FromStr for OperatorCommand {
    type Err = anyhow::Error;

    /// Accepts the single-key form (`c`, `1`..`9`, `l`, `x`, `q`) or the long
    /// name.
    fn from_str(s: &str) -> Result<Self> {
        let token = s.trim().to_ascii_lowercase();
        match token.as_str() {
            "c" | "cycle" => Ok(Self::CycleCandidate),
            "l" | "lock" => Ok(Self::Lock),
            "x" | "clear" => Ok(Self::Clear),
            "q" | "quit" => Ok(Self::Quit),
            _ => match token.parse::<usize>() {
                Ok(n @ 1..=9) => Ok(Self::SelectCandidate(n - 1)),
                _ => Err(anyhow!("unknown operator command '{}'", s.trim())),
            },
        }
    }
}

/// What changed after applying a command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockEvent {
    CandidateSelected(String),
    CandidateCleared,
    /// The locked class changed to this class.
    Locked(String),
    Cleared,
    Quit,
}

/// Operator selection state, owned by the control loop.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TargetLock {
    locked_class: Option<String>,
    selected_candidate: Option<String>,
    selected_index: usize,
}

impl TargetLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with a class already locked.
    pub fn locked(class: impl Into<String>) -> Self {
        let class = class.into();
        Self {
            locked_class: Some(class.clone()),
            selected_candidate: Some(class),
            selected_index: 0,
        }
    }

    pub fn locked_class(&self) -> Option<&str> {
        self.locked_class.as_deref()
    }

    pub fn selected_candidate(&self) -> Option<&str> {
        self.selected_candidate.as_deref()
    }

    pub fn selected_index(&self) -> usize {
        self.selected_index
    }

    /// Apply one command against the classes seen this iteration.
    pub fn apply(&mut self, command: OperatorCommand, seen: &[String]) -> Option<LockEvent> {
        match command {
            OperatorCommand::CycleCandidate => {
                if seen.is_empty() {
                    self.selected_candidate = None;
                    return Some(LockEvent::CandidateCleared);
                }
                self.selected_index = (self.selected_index + 1) % seen.len();
                let class = seen[self.selected_index].clone();
                self.selected_candidate = Some(class.clone());
                Some(LockEvent::CandidateSelected(class))
            }
            OperatorCommand::SelectCandidate(index) => {
                let class = seen.get(index)?.clone();
                self.selected_index = index;
                self.selected_candidate = Some(class.clone());
                Some(LockEvent::CandidateSelected(class))
            }
            OperatorCommand::Lock => {
                let candidate = self.selected_candidate.clone()?;
                if self.locked_class.as_deref() == Some(candidate.as_str()) {
                    return None;
                }
                self.locked_class = Some(candidate.clone());
                Some(LockEvent::Locked(candidate))
            }
            OperatorCommand::Clear => {
                self.locked_class = None;
                Some(LockEvent::Cleared)
            }
            OperatorCommand::Quit => Some(LockEvent::Quit),
        }
    }
}

/// Source of operator commands for the control loop.
pub struct OperatorInput {
    rx: Receiver<OperatorCommand>,
    _reader: Option<JoinHandle<()>>,
}

impl OperatorInput {
    /// Channel-backed input; the returned sender feeds commands in.
    pub fn channel() -> (Sender<OperatorCommand>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx, _reader: None })
    }

    /// Read one command per line from stdin on a background thread.
    pub fn spawn_stdin() -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let reader = std::thread::Builder::new()
            .name("operator-stdin".into())
            .spawn(move || {
                let stdin = std::io::stdin();
                for line in stdin.lock().lines() {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            log::warn!("operator input closed: {}", e);
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match line.parse::<OperatorCommand>() {
                        Ok(command) => {
                            if tx.send(command).is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("{} (use c, 1-9, l, x, q)", e),
                    }
                }
            })
            .context("spawn operator input thread")?;
        Ok(Self {
            rx,
            _reader: Some(reader),
        })
    }

    /// Input that never yields a command.
    pub fn none() -> Self {
        let (_tx, input) = Self::channel();
        input
    }

    /// Next pending command, if any. Never blocks.
    pub fn next(&self) -> Option<OperatorCommand> {
        match self.rx.try_recv() {
            Ok(command) => Some(command),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seen(classes: &[&str]) -> Vec<String> {
        classes.iter().map(|c| c.to_string()).collect()
    }

    #[test]
    fn commands_parse_from_keys_and_names() {
        assert_eq!("c".parse::<OperatorCommand>().unwrap(), OperatorCommand::CycleCandidate);
        assert_eq!("3".parse::<OperatorCommand>().unwrap(), OperatorCommand::SelectCandidate(2));
        assert_eq!(" Lock ".parse::<OperatorCommand>().unwrap(), OperatorCommand::Lock);
        assert_eq!("x".parse::<OperatorCommand>().unwrap(), OperatorCommand::Clear);
        assert_eq!("quit".parse::<OperatorCommand>().unwrap(), OperatorCommand::Quit);
        assert!("0".parse::<OperatorCommand>().is_err());
        assert!("10".parse::<OperatorCommand>().is_err());
        assert!("z".parse::<OperatorCommand>().is_err());
    }

    #[test]
    fn cycle_advances_before_reading() {
        let mut lock = TargetLock::new();
        let classes = seen(&["cup", "dog", "person"]);
        assert_eq!(
            lock.apply(OperatorCommand::CycleCandidate, &classes),
            Some(LockEvent::CandidateSelected("dog".into()))
        );
        assert_eq!(
            lock.apply(OperatorCommand::CycleCandidate, &classes),
            Some(LockEvent::CandidateSelected("person".into()))
        );
        assert_eq!(
            lock.apply(OperatorCommand::CycleCandidate, &classes),
            Some(LockEvent::CandidateSelected("cup".into()))
        );
    }

    #[test]
    fn cycle_with_nothing_seen_clears_candidate() {
        let mut lock = TargetLock::new();
        lock.apply(OperatorCommand::SelectCandidate(0), &seen(&["person"]));
        assert_eq!(
            lock.apply(OperatorCommand::CycleCandidate, &[]),
            Some(LockEvent::CandidateCleared)
        );
        assert_eq!(lock.selected_candidate(), None);
        assert_eq!(lock.apply(OperatorCommand::Lock, &[]), None);
    }

    #[test]
    fn select_out_of_range_is_ignored() {
        let mut lock = TargetLock::new();
        assert_eq!(lock.apply(OperatorCommand::SelectCandidate(4), &seen(&["person"])), None);
        assert_eq!(lock.selected_candidate(), None);
    }

    #[test]
    fn lock_reports_only_changes() {
        let mut lock = TargetLock::new();
        let classes = seen(&["person"]);
        lock.apply(OperatorCommand::SelectCandidate(0), &classes);
        assert_eq!(
            lock.apply(OperatorCommand::Lock, &classes),
            Some(LockEvent::Locked("person".into()))
        );
        assert_eq!(lock.apply(OperatorCommand::Lock, &classes), None);
        assert_eq!(lock.locked_class(), Some("person"));
    }

    #[test]
    fn clear_drops_lock_but_keeps_candidate() {
        let mut lock = TargetLock::locked("person");
        assert_eq!(lock.apply(OperatorCommand::Clear, &[]), Some(LockEvent::Cleared));
        assert_eq!(lock.locked_class(), None);
        assert_eq!(lock.selected_candidate(), Some("person"));
    }

    #[test]
    fn channel_input_yields_one_command_per_call() {
        let (tx, input) = OperatorInput::channel();
        tx.send(OperatorCommand::Lock).unwrap();
        tx.send(OperatorCommand::Quit).unwrap();
        assert_eq!(input.next(), Some(OperatorCommand::Lock));
        assert_eq!(input.next(), Some(OperatorCommand::Quit));
        assert_eq!(input.next(), None);
    }
}
