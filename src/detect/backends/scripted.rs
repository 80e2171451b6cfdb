use anyhow::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use crate::detect::backend::DetectorBackend;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Deterministic backend that replays scripted detection batches.
///
/// Each `infer` call pops the next batch; once the script is exhausted the
/// fallback batch is returned (empty unless set with `repeating`). Clones share
/// state, so a test can keep a clone to push batches or inspect calls after the
/// backend has been boxed into the control loop.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    state: Arc<Mutex<ScriptState>>,
}

#[derive(Default)]
struct ScriptState {
    script: VecDeque<Vec<Detection>>,
    fallback: Vec<Detection>,
    calls: u64,
    last_frame_size: Option<(u32, u32)>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Backend that returns the same batch on every call.
    pub fn repeating(batch: Vec<Detection>) -> Self {
        let backend = Self::new();
        backend.lock().fallback = batch;
        backend
    }

    /// Queue one batch to be returned by a future `infer` call.
    pub fn push(&self, batch: Vec<Detection>) {
        self.lock().script.push_back(batch);
    }

    /// Replace the batch returned once the script runs out.
    pub fn set_fallback(&self, batch: Vec<Detection>) {
        self.lock().fallback = batch;
    }

    /// Number of `infer` calls so far.
    pub fn calls(&self) -> u64 {
        self.lock().calls
    }

    /// Dimensions of the most recent frame passed to `infer`.
    pub fn last_frame_size(&self) -> Option<(u32, u32)> {
        self.lock().last_frame_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl DetectorBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn infer(&mut self, frame: &Frame, threshold: f32) -> Result<Vec<Detection>> {
        let mut state = self.lock();
        state.calls += 1;
        state.last_frame_size = Some((frame.width(), frame.height()));
        let batch = match state.script.pop_front() {
            Some(batch) => batch,
            None => state.fallback.clone(),
        };
        Ok(batch
            .into_iter()
            .filter(|d| d.confidence >= threshold)
            .collect())
    }
}
