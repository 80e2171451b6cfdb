use anyhow::{anyhow, Context, Result};
use std::process::{Command, Stdio};

use super::NotificationSink;

/// Speaks by running an external command with the text as its last argument,
/// e.g. `espeak -s 175`.
pub struct CommandSpeech {
    program: String,
    args: Vec<String>,
}

impl CommandSpeech {
    pub fn parse(command_line: &str) -> Result<Self> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| anyhow!("speech command is empty"))?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl NotificationSink for CommandSpeech {
    fn name(&self) -> &'static str {
        "speech"
    }

    fn deliver(&mut self, text: &str) -> Result<()> {
        let status = Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .status()
            .with_context(|| format!("run speech command '{}'", self.program))?;
        if !status.success() {
            return Err(anyhow!("speech command '{}' exited with {}", self.program, status));
        }
        Ok(())
    }
}

/// Fallback when no speech command is configured.
pub struct LogSpeech;

impl NotificationSink for LogSpeech {
    fn name(&self) -> &'static str {
        "speech"
    }

    fn deliver(&mut self, text: &str) -> Result<()> {
        log::info!("[SPEECH] {}", text);
        Ok(())
    }
}

/// Build the speech sink for an optional command line.
pub fn speech_sink(command_line: Option<&str>) -> Result<Box<dyn NotificationSink>> {
    match command_line.map(str::trim).filter(|c| !c.is_empty()) {
        Some(command_line) => {
            log::info!("speech via '{}'", command_line);
            Ok(Box::new(CommandSpeech::parse(command_line)?))
        }
        None => {
            log::info!("no speech command configured; speech is logged only");
            Ok(Box::new(LogSpeech))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_line_is_split_into_program_and_args() {
        let speech = CommandSpeech::parse("espeak -s 175").unwrap();
        assert_eq!(speech.program, "espeak");
        assert_eq!(speech.args, vec!["-s".to_string(), "175".to_string()]);
        assert!(CommandSpeech::parse("   ").is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_exit_status_is_checked() {
        assert!(CommandSpeech::parse("true").unwrap().deliver("hello").is_ok());
        assert!(CommandSpeech::parse("false").unwrap().deliver("hello").is_err());
    }

    #[test]
    fn blank_command_falls_back_to_log() {
        let mut sink = speech_sink(Some("  ")).unwrap();
        assert!(sink.deliver("Follow robot targeting").is_ok());
    }
}
