//! Asynchronous operator notifications (speech and SMS alerts).
//!
//! A `Notifier` owns one worker thread and a bounded queue. `notify` applies
//! the cooldown and enqueues without waiting; if the queue is full the
//! request is dropped. Delivery failures are logged by the worker and never
//! reach the control loop.

pub mod sms;
pub mod speech;

use anyhow::{anyhow, Context, Result};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub use sms::{alert_sink_from_env, LogOnlyAlert, TwilioSms};
pub use speech::{speech_sink, CommandSpeech, LogSpeech};

/// Something that can deliver a text message. Runs on the worker thread.
pub trait NotificationSink: Send {
    fn name(&self) -> &'static str;

    fn deliver(&mut self, text: &str) -> Result<()>;
}

/// How the cooldown window is applied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CooldownPolicy {
    /// Suppress only a repeat of the previous text (speech).
    RepeatedText,
    /// Suppress any message; a failed delivery reopens the window (SMS).
    AnyText,
}

#[derive(Default)]
struct Gate {
    last_text: Option<String>,
    last_sent: Option<Instant>,
}

struct Request {
    text: String,
    stamped_at: Instant,
    previous: Option<Instant>,
}

pub struct Notifier {
    name: &'static str,
    policy: CooldownPolicy,
    gate: Arc<Mutex<Gate>>,
    tx: Option<SyncSender<Request>>,
    join: Option<JoinHandle<()>>,
}

impl Notifier {
    pub fn spawn(
        sink: Box<dyn NotificationSink>,
        policy: CooldownPolicy,
        queue_depth: usize,
    ) -> Result<Self> {
        if queue_depth == 0 {
            return Err(anyhow!("notification queue depth must be > 0"));
        }
        let name = sink.name();
        let gate = Arc::new(Mutex::new(Gate::default()));
        let (tx, rx) = mpsc::sync_channel(queue_depth);
        let worker_gate = Arc::clone(&gate);
        let join = std::thread::Builder::new()
            .name(format!("notify-{}", name))
            .spawn(move || run_worker(sink, policy, rx, worker_gate))
            .with_context(|| format!("spawn {} notification worker", name))?;
        Ok(Self {
            name,
            policy,
            gate,
            tx: Some(tx),
            join: Some(join),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn notify(&self, text: &str, cooldown: Duration) -> bool {
        self.notify_at(text, cooldown, Instant::now())
    }

    /// Returns true when the message was queued.
    pub fn notify_at(&self, text: &str, cooldown: Duration, now: Instant) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        let mut gate = lock(&self.gate);
        let within_cooldown = gate
            .last_sent
            .is_some_and(|at| now.saturating_duration_since(at) < cooldown);
        let suppressed = match self.policy {
            CooldownPolicy::RepeatedText => {
                within_cooldown && gate.last_text.as_deref() == Some(text)
            }
            CooldownPolicy::AnyText => within_cooldown,
        };
        if suppressed {
            return false;
        }

        let request = Request {
            text: text.to_string(),
            stamped_at: now,
            previous: gate.last_sent,
        };
        match tx.try_send(request) {
            Ok(()) => {
                gate.last_text = Some(text.to_string());
                gate.last_sent = Some(now);
                true
            }
            Err(TrySendError::Full(_)) => {
                log::debug!("{} queue full; dropping '{}'", self.name, text);
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                log::warn!("{} worker has exited; dropping '{}'", self.name, text);
                false
            }
        }
    }

    /// When the last accepted message was stamped.
    pub fn last_sent(&self) -> Option<Instant> {
        lock(&self.gate).last_sent
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        // closing the queue lets the worker drain and exit
        self.tx.take();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_worker(
    mut sink: Box<dyn NotificationSink>,
    policy: CooldownPolicy,
    rx: Receiver<Request>,
    gate: Arc<Mutex<Gate>>,
) {
    for request in rx {
        match sink.deliver(&request.text) {
            Ok(()) => log::debug!("{} delivered '{}'", sink.name(), request.text),
            Err(e) => {
                log::warn!("{} delivery failed: {:#}", sink.name(), e);
                if policy == CooldownPolicy::AnyText {
                    let mut gate = lock(&gate);
                    if gate.last_sent == Some(request.stamped_at) {
                        gate.last_sent = request.previous;
                    }
                }
            }
        }
    }
}

fn lock(gate: &Mutex<Gate>) -> MutexGuard<'_, Gate> {
    gate.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Sink that records delivered texts. Clones share the record.
#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<RecordingState>>,
}

#[derive(Default)]
struct RecordingState {
    delivered: Vec<String>,
    attempts: u64,
    failing: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent deliveries fail.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    pub fn delivered(&self) -> Vec<String> {
        self.lock().delivered.clone()
    }

    pub fn attempts(&self) -> u64 {
        self.lock().attempts
    }

    fn lock(&self) -> MutexGuard<'_, RecordingState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl NotificationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn deliver(&mut self, text: &str) -> Result<()> {
        let mut state = self.lock();
        state.attempts += 1;
        if state.failing {
            return Err(anyhow!("delivery refused"));
        }
        state.delivered.push(text.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notifier(sink: &RecordingSink, policy: CooldownPolicy) -> Notifier {
        Notifier::spawn(Box::new(sink.clone()), policy, 8).unwrap()
    }

    #[test]
    fn speech_suppresses_only_repeats_within_cooldown() {
        let sink = RecordingSink::new();
        let speech = notifier(&sink, CooldownPolicy::RepeatedText);
        let t0 = Instant::now();
        let cooldown = Duration::from_secs(3);
        assert!(speech.notify_at("Emergency signal detected", cooldown, t0));
        assert!(!speech.notify_at("Emergency signal detected", cooldown, t0 + Duration::from_secs(1)));
        assert!(speech.notify_at("Target cleared", cooldown, t0 + Duration::from_secs(1)));
        assert!(speech.notify_at("Target cleared", Duration::from_millis(500), t0 + Duration::from_secs(2)));
        drop(speech);
        assert_eq!(
            sink.delivered(),
            vec![
                "Emergency signal detected".to_string(),
                "Target cleared".to_string(),
                "Target cleared".to_string()
            ]
        );
    }

    #[test]
    fn alerts_suppress_any_text_within_cooldown() {
        let sink = RecordingSink::new();
        let alerts = notifier(&sink, CooldownPolicy::AnyText);
        let t0 = Instant::now();
        let cooldown = Duration::from_secs(30);
        assert!(alerts.notify_at("first", cooldown, t0));
        assert!(!alerts.notify_at("second", cooldown, t0 + Duration::from_secs(10)));
        assert!(alerts.notify_at("third", cooldown, t0 + Duration::from_secs(30)));
        drop(alerts);
        assert_eq!(sink.delivered(), vec!["first".to_string(), "third".to_string()]);
    }

    #[test]
    fn failed_alert_reopens_cooldown() {
        let sink = RecordingSink::new();
        sink.set_failing(true);
        let alerts = notifier(&sink, CooldownPolicy::AnyText);
        let t0 = Instant::now();
        assert!(alerts.notify_at("alert", Duration::from_secs(30), t0));

        let deadline = Instant::now() + Duration::from_secs(5);
        while alerts.last_sent().is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(alerts.last_sent().is_none());

        sink.set_failing(false);
        assert!(alerts.notify_at("alert", Duration::from_secs(30), t0 + Duration::from_secs(1)));
        drop(alerts);
        assert_eq!(sink.attempts(), 2);
        assert_eq!(sink.delivered(), vec!["alert".to_string()]);
    }

    #[test]
    fn zero_queue_depth_is_rejected() {
        assert!(Notifier::spawn(Box::new(RecordingSink::new()), CooldownPolicy::AnyText, 0).is_err());
    }
}
