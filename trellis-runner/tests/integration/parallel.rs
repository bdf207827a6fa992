// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::{
    num::NonZeroUsize,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};
use test_case::test_case;
use trellis_metadata::{Message, MessageKind};
use trellis_runner::{
    aggregator::CapturedError,
    config::{ExecutionOptions, MaxParallelThreads},
    fixture::{Fixture, FixtureDefinition, Teardown},
    list::{CollectionBehavior, CollectionDefinition, TestAssembly},
    message_bus::MessageBusKind,
    reporter::{MessageSink, RecordingSink},
    runner::TestAssemblyRunner,
};

const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

fn parallel_options(threads: usize, message_bus: MessageBusKind) -> ExecutionOptions {
    ExecutionOptions::new()
        .with_max_parallel_threads(MaxParallelThreads::Count(
            NonZeroUsize::new(threads).expect("threads is non-zero"),
        ))
        .with_message_bus(message_bus)
}

/// Spins until `flag` is set, failing after a timeout.
fn wait_for(flag: &AtomicBool, what: &str) -> Result<(), CapturedError> {
    let start = Instant::now();
    while !flag.load(Ordering::SeqCst) {
        if start.elapsed() > WAIT_TIMEOUT {
            return Err(CapturedError::msg(format!("timed out waiting for {what}")));
        }
        thread::sleep(Duration::from_millis(1));
    }
    Ok(())
}

#[test]
fn collections_in_flight_are_bounded() -> Result<()> {
    let mut tree = TreeBuilder::new();
    for i in 0..6 {
        let collection = tree.collection(&format!("collection-{i}"));
        let class = class(&collection, "Slow");
        for name in ["first", "second"] {
            tree.fact(&class, name, |_| {
                thread::sleep(Duration::from_millis(10));
                Ok(())
            });
        }
    }

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));
    let recorder = RecordingSink::new();
    let sink = {
        let in_flight = in_flight.clone();
        let max_in_flight = max_in_flight.clone();
        let mut recorder = recorder.clone();
        move |message: &Message| {
            match message.kind {
                MessageKind::CollectionStarting { .. } => {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                }
                MessageKind::CollectionFinished { .. } => {
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                }
                _ => {}
            }
            recorder.on_message(message)
        }
    };

    let (assembly, cases) = tree.into_parts();
    let options = parallel_options(2, MessageBusKind::Synchronous);
    let summary = TestAssemblyRunner::new(assembly, cases, options).run(sink)?;

    assert_eq!((summary.total, summary.failed), (12, 0));
    let max = max_in_flight.load(Ordering::SeqCst);
    assert!((1..=2).contains(&max), "max in flight was {max}");

    let messages = recorder.messages();
    let environment = messages.iter().find_map(|m| match &m.kind {
        MessageKind::AssemblyStarting {
            test_environment, ..
        } => Some(test_environment.clone()),
        _ => None,
    });
    assert_eq!(
        environment,
        Some(format!("{}-bit trellis [parallel (2 threads)]", usize::BITS))
    );
    RunResult { summary, messages }.check_structure()
}

#[test_case(MessageBusKind::Synchronous; "sync bus")]
#[test_case(MessageBusKind::Asynchronous; "async bus")]
fn stop_on_fail_finishes_running_collections(message_bus: MessageBusKind) -> Result<()> {
    let failing_started = Arc::new(AtomicBool::new(false));
    let waiting_started = Arc::new(AtomicBool::new(false));
    let failure_seen = Arc::new(AtomicBool::new(false));
    let fixture_disposed = Arc::new(AtomicBool::new(false));

    let definition = {
        let fixture_disposed = fixture_disposed.clone();
        CollectionDefinition::new("WaitingCollection").with_fixture(
            FixtureDefinition::new::<String>().with_constructor(Vec::new(), move |_| {
                let fixture_disposed = fixture_disposed.clone();
                Ok(Fixture::new("shared".to_owned()).with_teardown(Teardown::new().with_sync(
                    move || {
                        fixture_disposed.store(true, Ordering::SeqCst);
                        Ok(())
                    },
                )))
            }),
        )
    };

    let mut tree = TreeBuilder::new();
    let failing = tree.collection("failing");
    let failing_class = class(&failing, "Failing");
    {
        let failing_started = failing_started.clone();
        let waiting_started = waiting_started.clone();
        tree.fact(&failing_class, "fails", move |_| {
            failing_started.store(true, Ordering::SeqCst);
            wait_for(&waiting_started, "the other collection")?;
            Err(CapturedError::msg("boom"))
        });
    }

    let waiting = tree.defined_collection("waiting", definition);
    let in_progress = class(&waiting, "InProgress");
    {
        let waiting_started = waiting_started.clone();
        let failure_seen = failure_seen.clone();
        tree.fact(&in_progress, "waits", move |_| {
            waiting_started.store(true, Ordering::SeqCst);
            wait_for(&failure_seen, "the failure")
        });
    }
    let never = class(&waiting, "NeverStarted");
    tree.passing(&never, "runs");

    let recorder = RecordingSink::new();
    let sink = {
        let failure_seen = failure_seen.clone();
        let mut recorder = recorder.clone();
        move |message: &Message| {
            let cont = recorder.on_message(message);
            if message.is_test_failure() {
                failure_seen.store(true, Ordering::SeqCst);
            }
            cont
        }
    };

    let options = parallel_options(2, message_bus)
        .with_stop_on_fail(true)
        .with_collection_orderer("declaration")
        .with_case_orderer("declaration");
    let (assembly, cases) = tree.into_parts();
    let summary = TestAssemblyRunner::new(assembly, cases, options).run(sink)?;

    let messages = recorder.messages();
    let result = RunResult { summary, messages };
    assert_eq!(
        result.failures(),
        vec![("Failing.fails".to_owned(), vec!["boom".to_owned()])]
    );
    assert_eq!((result.summary.total, result.summary.failed), (2, 1));

    let classes: Vec<_> = result
        .messages
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::ClassStarting { class_name } => Some(class_name.as_str()),
            _ => None,
        })
        .collect();
    assert!(!classes.contains(&"NeverStarted"), "classes: {classes:?}");
    assert_eq!(
        result.count(|k| matches!(k, MessageKind::CollectionFinished { .. })),
        2
    );
    assert!(fixture_disposed.load(Ordering::SeqCst));
    result.check_structure()
}

#[test]
fn serial_runs_on_calling_thread() -> Result<()> {
    let threads = Arc::new(Mutex::new(Vec::new()));
    let mut tree = TreeBuilder::with_assembly(TestAssembly::new("sample-tests").with_behavior(
        CollectionBehavior {
            disable_parallelization: Some(true),
            max_parallel_threads: None,
        },
    ));
    for i in 0..3 {
        let collection = tree.collection(&format!("collection-{i}"));
        let class = class(&collection, "Tests");
        let threads = threads.clone();
        tree.fact(&class, "records_thread", move |_| {
            threads.lock().unwrap().push(thread::current().id());
            Ok(())
        });
    }

    let options = ExecutionOptions::new().with_message_bus(MessageBusKind::Synchronous);
    let result = tree.run(options)?;

    assert_eq!(result.summary.total, 3);
    let current = thread::current().id();
    assert!(threads.lock().unwrap().iter().all(|id| *id == current));

    let environment = result.messages.iter().find_map(|m| match &m.kind {
        MessageKind::AssemblyStarting {
            test_environment, ..
        } => Some(test_environment.clone()),
        _ => None,
    });
    assert_eq!(
        environment,
        Some(format!("{}-bit trellis [non-parallel]", usize::BITS))
    );
    result.check_structure()
}

#[test]
fn async_bus_delivers_every_message() -> Result<()> {
    let mut tree = TreeBuilder::new();
    for i in 0..4 {
        let collection = tree.collection(&format!("collection-{i}"));
        let class = class(&collection, "Tests");
        tree.passing(&class, "passes");
        tree.failing(&class, "fails", "expected failure");
    }

    let options = ExecutionOptions::new()
        .with_max_parallel_threads(MaxParallelThreads::Unlimited)
        .with_message_bus(MessageBusKind::Asynchronous);
    let result = tree.run(options)?;

    assert_eq!((result.summary.total, result.summary.failed), (8, 4));
    assert_eq!(result.names().last(), Some(&"assembly-finished"));
    assert_eq!(result.assembly_finished(), Some(result.summary));
    result.check_structure()
}
