// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The channel between the runners and the message sink.
//!
//! Runners on any thread queue messages on a [`MessageBus`]; the bus hands them to the single
//! [`MessageSink`] in the order they were queued. The bus also owns the run's "should we keep
//! going" state: once the sink has asked to stop (or, with stop-on-fail, once a test has failed),
//! every later call to [`queue_message`](MessageBus::queue_message) returns `false`.

use crate::{
    aggregator::{CapturedError, panic_message},
    errors::{MessageBusShutdownError, SpawnError},
    reporter::MessageSink,
};
use crossbeam_channel::Sender;
use serde::Deserialize;
use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};
use trellis_metadata::{LifecyclePhase, Message, MessageKind, NodeIds};

/// An ordered channel from message producers to a [`MessageSink`].
pub trait MessageBus: Send + Sync {
    /// Queues a message for delivery, returning whether the run should continue.
    ///
    /// # Panics
    ///
    /// Panics if called after [`shutdown`](Self::shutdown).
    fn queue_message(&self, message: Message) -> bool;

    /// Delivers any messages that are still queued and releases the bus's resources.
    ///
    /// Returns an error if the bus was already shut down.
    fn shutdown(&self) -> Result<(), MessageBusShutdownError>;
}

/// How a message bus delivers messages to its sink.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
pub enum MessageBusKind {
    /// Deliver each message on the thread that queued it, before `queue_message` returns.
    #[serde(rename = "sync")]
    Synchronous,

    /// Deliver messages on a dedicated dispatch thread.
    #[default]
    #[serde(rename = "async")]
    Asynchronous,
}

/// Creates a message bus of the given kind.
pub fn new_message_bus(
    kind: MessageBusKind,
    sink: impl MessageSink + 'static,
    stop_on_fail: bool,
) -> Result<Arc<dyn MessageBus>, SpawnError> {
    let bus: Arc<dyn MessageBus> = match kind {
        MessageBusKind::Synchronous => Arc::new(SynchronousMessageBus::new(sink, stop_on_fail)),
        MessageBusKind::Asynchronous => Arc::new(AsyncMessageBus::new(sink, stop_on_fail)?),
    };
    Ok(bus)
}

/// Sends diagnostic messages on behalf of a node.
///
/// Fixtures (through a constructor parameter of this type) and orderers use this to report
/// problems that are not test failures.
#[derive(Clone)]
pub struct DiagnosticSender {
    bus: Arc<dyn MessageBus>,
    ids: NodeIds,
}

impl DiagnosticSender {
    pub(crate) fn new(bus: Arc<dyn MessageBus>, ids: NodeIds) -> Self {
        Self { bus, ids }
    }

    /// Sends a diagnostic message, returning whether the run should continue.
    pub fn send(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        tracing::debug!(node = %self.ids.node_id(), "diagnostic: {message}");
        self.bus.queue_message(Message::new(
            self.ids.clone(),
            MessageKind::Diagnostic { message },
        ))
    }
}

impl fmt::Debug for DiagnosticSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticSender")
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

/// Delivery logic shared by both kinds of bus.
#[derive(Debug)]
struct DeliveryState {
    continue_running: AtomicBool,
    stop_on_fail: bool,
}

impl DeliveryState {
    fn new(stop_on_fail: bool) -> Self {
        Self {
            continue_running: AtomicBool::new(true),
            stop_on_fail,
        }
    }

    fn should_continue(&self) -> bool {
        self.continue_running.load(Ordering::Acquire)
    }

    fn stop(&self) {
        self.continue_running.store(false, Ordering::Release);
    }

    fn deliver(&self, sink: &mut dyn MessageSink, message: &Message) {
        if self.stop_on_fail && message.is_test_failure() {
            self.stop();
        }

        match catch_unwind(AssertUnwindSafe(|| sink.on_message(message))) {
            Ok(true) => {}
            Ok(false) => self.stop(),
            Err(payload) => {
                let error = CapturedError::from_panic(payload);
                tracing::warn!(
                    "message sink panicked while handling `{}`: {}",
                    message.kind.name(),
                    error
                );

                // Best-effort: tell the sink about its own failure.
                let error_message = Message::new(
                    NodeIds::for_assembly(message.ids.assembly.clone()),
                    MessageKind::Error {
                        error: error.to_error_metadata(),
                    },
                );
                match catch_unwind(AssertUnwindSafe(|| sink.on_message(&error_message))) {
                    Ok(true) => {}
                    Ok(false) => self.stop(),
                    Err(payload) => {
                        tracing::warn!(
                            "message sink panicked while handling an error message: {}",
                            panic_message(payload.as_ref())
                        );
                    }
                }
            }
        }
    }
}

/// A bus that delivers every message on the queueing thread.
///
/// Concurrent producers are serialized by a lock around the sink.
pub struct SynchronousMessageBus {
    sink: Mutex<Box<dyn MessageSink>>,
    state: DeliveryState,
    shut_down: AtomicBool,
}

impl SynchronousMessageBus {
    /// Creates a new synchronous bus.
    pub fn new(sink: impl MessageSink + 'static, stop_on_fail: bool) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            state: DeliveryState::new(stop_on_fail),
            shut_down: AtomicBool::new(false),
        }
    }
}

impl MessageBus for SynchronousMessageBus {
    fn queue_message(&self, message: Message) -> bool {
        if self.shut_down.load(Ordering::Acquire) {
            panic!(
                "queue_message called with `{}` after the message bus was shut down",
                message.kind.name()
            );
        }

        let mut sink = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        self.state.deliver(sink.as_mut(), &message);
        self.state.should_continue()
    }

    fn shutdown(&self) -> Result<(), MessageBusShutdownError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(MessageBusShutdownError::AlreadyShutDown);
        }
        Ok(())
    }
}

impl fmt::Debug for SynchronousMessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronousMessageBus")
            .field("state", &self.state)
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

/// A bus that delivers messages on a dedicated dispatch thread.
///
/// Messages are delivered in the order they were queued. With stop-on-fail, a failed test stops
/// the run as soon as it is queued, before the sink sees it. Queueing a lifecycle starting message
/// returns only once the sink has answered it, so a sink that asks to stop on a starting message
/// keeps that node's children from running. Other messages return the stop signal as of the
/// messages delivered so far.
pub struct AsyncMessageBus {
    // None once shut down.
    sender: RwLock<Option<Sender<Envelope>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    state: Arc<DeliveryState>,
}

impl AsyncMessageBus {
    const THREAD_NAME: &'static str = "trellis-message-bus";

    /// Creates a new asynchronous bus, spawning its dispatch thread.
    pub fn new(sink: impl MessageSink + 'static, stop_on_fail: bool) -> Result<Self, SpawnError> {
        let (sender, receiver) = crossbeam_channel::unbounded::<Envelope>();
        let state = Arc::new(DeliveryState::new(stop_on_fail));

        let dispatch_state = state.clone();
        let mut sink = sink;
        let dispatcher = thread::Builder::new()
            .name(Self::THREAD_NAME.to_owned())
            .spawn(move || {
                // Ends once the bus is shut down and every queued message was delivered.
                for Envelope { message, delivered } in receiver.iter() {
                    dispatch_state.deliver(&mut sink, &message);
                    if let Some(delivered) = delivered {
                        // Ignored if the producer is gone.
                        _ = delivered.send(());
                    }
                }
            })
            .map_err(|err| SpawnError::new(Self::THREAD_NAME, err))?;

        Ok(Self {
            sender: RwLock::new(Some(sender)),
            dispatcher: Mutex::new(Some(dispatcher)),
            state,
        })
    }
}

impl MessageBus for AsyncMessageBus {
    fn queue_message(&self, message: Message) -> bool {
        let sender = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            panic!(
                "queue_message called with `{}` after the message bus was shut down",
                message.kind.name()
            );
        };

        if self.state.stop_on_fail && message.is_test_failure() {
            self.state.stop();
        }

        let (delivered, wait_for) = if is_starting(&message) {
            let (tx, rx) = crossbeam_channel::bounded(1);
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        if let Err(err) = sender.send(Envelope { message, delivered }) {
            // The dispatch thread only exits after shutdown, so this is unexpected.
            tracing::error!(
                "message bus dispatcher is gone, dropping `{}`",
                err.into_inner().message.kind.name()
            );
            self.state.stop();
            return false;
        }

        if let Some(wait_for) = wait_for
            && wait_for.recv().is_err()
        {
            tracing::error!("message bus dispatcher exited before answering a starting message");
            self.state.stop();
        }
        self.state.should_continue()
    }

    fn shutdown(&self) -> Result<(), MessageBusShutdownError> {
        let sender = self
            .sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(MessageBusShutdownError::AlreadyShutDown)?;
        // Disconnect the channel: the dispatcher drains what is left, then exits.
        drop(sender);

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher
                .join()
                .map_err(|payload| MessageBusShutdownError::DispatcherPanicked {
                    message: panic_message(payload.as_ref()),
                })?;
        }
        Ok(())
    }
}

impl Drop for AsyncMessageBus {
    fn drop(&mut self) {
        let running = self
            .sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if running {
            _ = self.shutdown();
        }
    }
}

/// A queued message, along with where to signal once the sink has handled it.
struct Envelope {
    message: Message,
    delivered: Option<Sender<()>>,
}

fn is_starting(message: &Message) -> bool {
    matches!(message.lifecycle(), Some((_, LifecyclePhase::Starting)))
}

impl fmt::Debug for AsyncMessageBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMessageBus")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}
