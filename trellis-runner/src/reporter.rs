// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Consumers of the message stream.
//!
//! A run reports everything it does to a single [`MessageSink`]. The sink's return value is the
//! only way for a consumer to influence the run: returning `false` requests cancellation.

use debug_ignore::DebugIgnore;
use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use trellis_metadata::{Message, MessageKind, RunSummary};

/// Receives every message emitted during a run.
pub trait MessageSink: Send {
    /// Handles a message, returning whether the run should continue.
    fn on_message(&mut self, message: &Message) -> bool;
}

impl<F> MessageSink for F
where
    F: FnMut(&Message) -> bool + Send,
{
    fn on_message(&mut self, message: &Message) -> bool {
        self(message)
    }
}

type StopPredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// A sink that records every message it receives.
///
/// Clones share the same recording, so a clone can be handed to the engine while the original is
/// kept to inspect the messages afterwards.
#[derive(Clone, Default)]
pub struct RecordingSink {
    messages: Arc<Mutex<Vec<Message>>>,
    stop_when: Option<DebugIgnore<StopPredicate>>,
}

impl RecordingSink {
    /// Creates a sink that records messages and never requests cancellation.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a sink that records messages and requests cancellation whenever `predicate`
    /// returns true for a message.
    pub fn stop_when(predicate: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        Self {
            messages: Arc::default(),
            stop_when: Some(DebugIgnore(Arc::new(predicate) as StopPredicate)),
        }
    }

    /// Returns a copy of every message recorded so far.
    pub fn messages(&self) -> Vec<Message> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the summary carried by the final `AssemblyFinished` message, if one was recorded.
    pub fn assembly_summary(&self) -> Option<RunSummary> {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .find_map(|message| match &message.kind {
                MessageKind::AssemblyFinished { summary } => Some(*summary),
                _ => None,
            })
    }
}

impl MessageSink for RecordingSink {
    fn on_message(&mut self, message: &Message) -> bool {
        self.messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message.clone());
        !self
            .stop_when
            .as_ref()
            .is_some_and(|predicate| (predicate.0)(message))
    }
}

impl fmt::Debug for RecordingSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self
            .messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        f.debug_struct("RecordingSink")
            .field("messages", &len)
            .field("stop_when", &self.stop_when)
            .finish()
    }
}
