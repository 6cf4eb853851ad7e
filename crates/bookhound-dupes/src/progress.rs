use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::error::EvaluationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Hashing,
    Grouping,
    AnalyzingTarget,
    AnalyzingLocal,
    Variations,
    BinaryHashing,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Hashing => "hashing books",
            Stage::Grouping => "grouping",
            Stage::AnalyzingTarget => "analyzing target library",
            Stage::AnalyzingLocal => "analyzing local library",
            Stage::Variations => "hashing items",
            Stage::BinaryHashing => "hashing formats",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub stage: Stage,
    pub done: usize,
    pub total: usize,
}

pub type ProgressCallback = Box<dyn FnMut(&Progress) + Send>;

/// Cancellation flag and progress sink shared with the host.
///
/// The flag is polled between books and between groups; a run that sees it
/// set stops and returns what it has, marked as aborted.
pub struct RunControl {
    abort: Arc<AtomicBool>,
    progress: Option<ProgressCallback>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunControl")
            .field("aborted", &self.is_aborted())
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl RunControl {
    pub fn new() -> Self {
        Self {
            abort: Arc::new(AtomicBool::new(false)),
            progress: None,
        }
    }

    /// Handle the host sets to cancel the current run.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    pub fn on_progress(&mut self, callback: impl FnMut(&Progress) + Send + 'static) {
        self.progress = Some(Box::new(callback));
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.load(Ordering::Relaxed)
    }

    /// Clear a stale cancellation before a new run starts.
    pub(crate) fn reset(&self) {
        self.abort.store(false, Ordering::Relaxed);
    }

    pub(crate) fn report(&mut self, stage: Stage, done: usize, total: usize) {
        if let Some(callback) = self.progress.as_mut() {
            callback(&Progress { stage, done, total });
        }
    }
}

/// Errors and notes accumulated during one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunLog {
    pub errors: Vec<EvaluationError>,
    pub messages: Vec<String>,
}

impl RunLog {
    pub fn record_error(&mut self, error: EvaluationError) {
        tracing::warn!(
            book_id = error.book_id,
            algorithm = %error.algorithm,
            "skipping book: {}",
            error.message
        );
        self.errors.push(error);
    }

    pub fn note(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.messages.push(message);
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}
