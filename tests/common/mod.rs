#![allow(dead_code)]

use ckernel::{Office, OfficeBuilder, PassiveTeam, ProcessCompletion, process::ProcessCallback};
use parking_lot::Mutex;
use std::sync::Arc;

/// Builder of an office running everything on the calling thread.
pub fn passive_office() -> OfficeBuilder {
    Office::builder().team(Arc::new(PassiveTeam::new("main")))
}

/// Ordered record of events, shared between logic and test.
#[derive(Debug, Default, Clone)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn record(&self, event: impl Into<String>) {
        self.0.lock().push(event.into());
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().iter().filter(|recorded| *recorded == event).count()
    }
}

/// Slot filled by a process completion callback.
#[derive(Default, Clone)]
pub struct CompletionSlot(Arc<Mutex<Option<ProcessCompletion>>>);

impl CompletionSlot {
    pub fn callback(&self) -> Option<ProcessCallback> {
        let slot = self.0.clone();
        Some(Box::new(move |completion| {
            let previous = slot.lock().replace(completion);
            assert!(previous.is_none(), "process completed twice");
        }))
    }

    pub fn take(&self) -> Option<ProcessCompletion> {
        self.0.lock().take()
    }

    pub fn is_filled(&self) -> bool {
        self.0.lock().is_some()
    }
}
