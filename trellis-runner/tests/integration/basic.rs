// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use maplit::btreemap;
use pretty_assertions::assert_eq;
use smol_str::SmolStr;
use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};
use trellis_metadata::{MessageKind, TrellisExitCode};
use trellis_runner::{
    aggregator::CapturedError,
    fixture::{Fixture, FixtureDefinition, Teardown},
    list::{CollectionDefinition, TestAssembly, TestBody, TestCase, TestMethod},
    message_bus::MessageBusKind,
    reporter::RecordingSink,
};
use test_case::test_case;

#[test]
fn all_tests_pass() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let math = class(&collection, "MathTests");
    let strings = class(&collection, "StringTests");
    for name in ["adds", "subtracts", "multiplies"] {
        tree.passing(&math, name);
    }
    for name in ["concatenates", "trims"] {
        tree.passing(&strings, name);
    }

    let result = tree.run(serial_options())?;

    assert_eq!(
        (result.summary.total, result.summary.failed, result.summary.skipped),
        (5, 0, 0)
    );
    assert_eq!(result.count(|k| matches!(k, MessageKind::TestPassed { .. })), 5);
    assert_eq!(result.count(|k| matches!(k, MessageKind::ClassFinished { .. })), 2);
    assert_eq!(
        result.count(|k| matches!(k, MessageKind::CollectionFinished { .. })),
        1
    );
    assert_eq!(
        result.count(|k| matches!(k, MessageKind::AssemblyFinished { .. })),
        1
    );
    assert_eq!(result.names().first(), Some(&"assembly-starting"));
    assert_eq!(result.names().last(), Some(&"assembly-finished"));
    assert_eq!(result.assembly_finished().map(|s| s.total), Some(5));
    assert_eq!(result.summary.exit_code(), TrellisExitCode::OK);
    result.check_structure()
}

#[test]
fn failing_test_does_not_stop_siblings() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Parser");
    tree.passing(&class, "parses_numbers");
    tree.failing(&class, "parses_dates", "expected 2024-01-01");
    tree.passing(&class, "parses_strings");

    let result = tree.run(serial_options())?;

    assert_eq!(
        result.failures(),
        vec![(
            "Parser.parses_dates".to_owned(),
            vec!["expected 2024-01-01".to_owned()]
        )]
    );
    assert_eq!(result.count(|k| matches!(k, MessageKind::TestPassed { .. })), 2);
    assert_eq!((result.summary.total, result.summary.failed), (3, 1));
    assert_eq!(result.summary.exit_code(), TrellisExitCode::TEST_RUN_FAILED);
    result.check_structure()
}

#[test]
fn panicking_test_is_reported_as_failure() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Panics");
    tree.fact(&class, "panics", |_| panic!("index out of bounds"));

    let result = tree.run(serial_options())?;

    let failures = result.failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].1, vec!["index out of bounds".to_owned()]);
    result.check_structure()
}

#[derive(Debug)]
struct Database;

#[test]
fn throwing_collection_fixture_fails_every_test() -> Result<()> {
    let bodies_run = Arc::new(AtomicUsize::new(0));
    let definition = CollectionDefinition::new("DatabaseCollection").with_fixture(
        FixtureDefinition::from_fn::<Database, _>(|| {
            Err(CapturedError::msg("database unavailable"))
        }),
    );

    let mut tree = TreeBuilder::new();
    let collection = tree.defined_collection("database", definition);
    let queries = class(&collection, "QueryTests");
    let migrations = class(&collection, "MigrationTests");
    for (class, name) in [(&queries, "selects"), (&queries, "inserts"), (&migrations, "migrates")] {
        let bodies_run = bodies_run.clone();
        tree.fact(class, name, move |_| {
            bodies_run.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let result = tree.run(serial_options())?;

    assert_eq!(bodies_run.load(Ordering::SeqCst), 0);
    let failures = result.failures();
    assert_eq!(failures.len(), 3);
    for (name, messages) in failures {
        assert!(
            messages[0].contains("Collection fixture type")
                && messages[0].contains("threw in its constructor"),
            "{name}: unexpected root message {:?}",
            messages[0]
        );
        assert!(messages.iter().any(|m| m == "database unavailable"));
    }
    assert_eq!((result.summary.total, result.summary.failed), (3, 3));
    result.check_structure()
}

#[test]
fn collection_fixture_is_shared_and_disposed() -> Result<()> {
    let disposed = Arc::new(AtomicBool::new(false));
    let constructed = Arc::new(AtomicUsize::new(0));
    let definition = {
        let disposed = disposed.clone();
        let constructed = constructed.clone();
        CollectionDefinition::new("DatabaseCollection").with_fixture(
            FixtureDefinition::new::<Database>().with_constructor(Vec::new(), move |_| {
                constructed.fetch_add(1, Ordering::SeqCst);
                let disposed = disposed.clone();
                Ok(Fixture::new(Database).with_teardown(Teardown::new().with_sync(move || {
                    disposed.store(true, Ordering::SeqCst);
                    Ok(())
                })))
            }),
        )
    };

    let mut tree = TreeBuilder::new();
    let collection = tree.defined_collection("database", definition);
    let class = class(&collection, "QueryTests");
    for name in ["selects", "inserts"] {
        let disposed = disposed.clone();
        tree.fact(&class, name, move |cx| {
            if cx.collection_fixture::<Database>().is_none() {
                return Err(CapturedError::msg("missing collection fixture"));
            }
            if disposed.load(Ordering::SeqCst) {
                return Err(CapturedError::msg("fixture disposed too early"));
            }
            Ok(())
        });
    }

    let result = tree.run(serial_options())?;

    assert_eq!(result.failures(), Vec::new());
    assert_eq!(constructed.load(Ordering::SeqCst), 1);
    assert!(disposed.load(Ordering::SeqCst));
    result.check_structure()
}

#[test]
fn failing_collection_teardown_reports_cleanup_failure() -> Result<()> {
    let definition = CollectionDefinition::new("DatabaseCollection").with_fixture(
        FixtureDefinition::new::<Database>().with_constructor(Vec::new(), |_| {
            Ok(Fixture::new(Database).with_teardown(
                Teardown::new().with_sync(|| Err(CapturedError::msg("connection reset"))),
            ))
        }),
    );

    let mut tree = TreeBuilder::new();
    let collection = tree.defined_collection("database", definition);
    let class = class(&collection, "QueryTests");
    tree.passing(&class, "selects");

    let result = tree.run(serial_options())?;

    // Cleanup failures do not change the summary.
    assert_eq!((result.summary.total, result.summary.failed), (1, 0));
    let cleanup: Vec<_> = result
        .messages
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::CollectionCleanupFailure { error } => Some(error.messages.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(cleanup, vec![vec!["connection reset".to_owned()]]);

    let names = result.names();
    let cleanup_at = names.iter().position(|n| *n == "collection-cleanup-failure");
    let finished_at = names.iter().position(|n| *n == "collection-finished");
    assert!(cleanup_at.is_some() && cleanup_at < finished_at);
    result.check_structure()
}

#[test_case(MessageBusKind::Synchronous; "sync bus")]
#[test_case(MessageBusKind::Asynchronous; "async bus")]
fn stop_at_assembly_starting(message_bus: MessageBusKind) -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Never");
    tree.passing(&class, "runs");

    let sink = RecordingSink::stop_when(|m| matches!(m.kind, MessageKind::AssemblyStarting { .. }));
    let result = tree.run_with_slow_sink(sink, serial_options_with(message_bus))?;

    assert_eq!(result.names(), vec!["assembly-starting", "assembly-finished"]);
    assert_eq!(
        (result.summary.total, result.summary.failed, result.summary.skipped),
        (0, 0, 0)
    );
    assert_eq!(result.assembly_finished().map(|s| s.total), Some(0));
    assert_eq!(result.summary.exit_code(), TrellisExitCode::NO_TESTS_RUN);
    Ok(())
}

#[test_case(MessageBusKind::Synchronous; "sync bus")]
#[test_case(MessageBusKind::Asynchronous; "async bus")]
fn stop_on_fail_skips_remaining_tests(message_bus: MessageBusKind) -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "StopsEarly");
    tree.failing(&class, "a_fails", "first failure");
    let ran = Arc::new(AtomicUsize::new(0));
    for name in ["b", "c", "d", "e", "f"] {
        let ran = ran.clone();
        tree.fact(&class, name, move |_| {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    let options = serial_options_with(message_bus).with_stop_on_fail(true);
    let result = tree.run_with_slow_sink(RecordingSink::new(), options)?;

    assert_eq!(ran.load(Ordering::SeqCst), 0, "no test runs after the failure");
    assert_eq!((result.summary.total, result.summary.failed), (1, 1));
    assert_eq!(
        result.failures(),
        vec![("StopsEarly.a_fails".to_owned(), vec!["first failure".to_owned()])]
    );
    assert_eq!(result.summary.exit_code(), TrellisExitCode::TEST_RUN_FAILED);
    result.check_structure()
}

#[test]
fn stop_at_test_starting_finishes_the_test() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Cancelled");
    let ran = Arc::new(AtomicBool::new(false));
    {
        let ran = ran.clone();
        tree.fact(&class, "first", move |_| {
            ran.store(true, Ordering::SeqCst);
            Ok(())
        });
    }
    tree.passing(&class, "second");

    let sink = RecordingSink::stop_when(|m| matches!(m.kind, MessageKind::TestStarting { .. }));
    let result = tree.run_with(sink, serial_options())?;

    assert!(!ran.load(Ordering::SeqCst), "cancelled test body must not run");
    assert_eq!(result.count(|k| matches!(k, MessageKind::TestStarting { .. })), 1);
    assert_eq!(result.count(|k| matches!(k, MessageKind::TestFinished { .. })), 1);
    assert_eq!(result.summary.total, 0);
    result.check_structure()
}

#[test]
fn skipped_tests() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Skips");
    let ran = Arc::new(AtomicBool::new(false));
    let method = {
        let ran = ran.clone();
        Arc::new(TestMethod::new(
            &class,
            "slow",
            TestBody::new(move |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            }),
        ))
    };
    tree.add(TestCase::fact(&method).with_skip_reason("too slow"));
    tree.passing(&class, "fast");

    let result = tree.run(serial_options())?;

    assert!(!ran.load(Ordering::SeqCst));
    assert_eq!(
        (result.summary.total, result.summary.failed, result.summary.skipped),
        (2, 0, 1)
    );
    let reasons: Vec<_> = result
        .messages
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::TestSkipped { reason } => Some(reason.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(reasons, vec!["too slow"]);
    result.check_structure()
}

#[test]
fn execution_error_case_fails_once() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Broken");
    let method = Arc::new(TestMethod::new(&class, "discovers", TestBody::new(|_| Ok(()))));
    tree.add(TestCase::execution_error(
        &method,
        "test method has an unsupported signature",
    ));

    let result = tree.run(serial_options())?;

    assert_eq!(
        result.failures(),
        vec![(
            "Broken.discovers".to_owned(),
            vec!["test method has an unsupported signature".to_owned()]
        )]
    );
    result.check_structure()
}

#[test]
fn test_output_is_reported() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Chatty");
    tree.fact(&class, "talks", |cx| {
        cx.write_line("hello");
        cx.write_line("world");
        Ok(())
    });

    let result = tree.run(serial_options())?;

    let lines: Vec<_> = result
        .messages
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::TestOutput { output } => Some(output.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(lines, vec!["hello\n", "world\n"]);

    let passed_output = result.messages.iter().find_map(|m| match &m.kind {
        MessageKind::TestPassed { output, .. } => Some(output.as_str()),
        _ => None,
    });
    assert_eq!(passed_output, Some("hello\nworld\n"));
    Ok(())
}

#[test]
fn async_bodies() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "AsyncTests");
    let ok = Arc::new(TestMethod::new(
        &class,
        "awaits",
        TestBody::new_async(|cx| async move {
            futures::future::ready(()).await;
            cx.write_line("awaited");
            Ok(())
        }),
    ));
    let fails = Arc::new(TestMethod::new(
        &class,
        "fails_after_await",
        TestBody::new_async(|_| async {
            futures::future::ready(()).await;
            Err(CapturedError::msg("async failure"))
        }),
    ));
    tree.add(TestCase::fact(&ok));
    tree.add(TestCase::fact(&fails));

    let result = tree.run(serial_options())?;

    assert_eq!(
        result.failures(),
        vec![(
            "AsyncTests.fails_after_await".to_owned(),
            vec!["async failure".to_owned()]
        )]
    );
    assert_eq!((result.summary.total, result.summary.failed), (2, 1));
    result.check_structure()
}

#[test]
fn unknown_orderer_falls_back_with_diagnostic() -> Result<()> {
    let mut tree = TreeBuilder::with_assembly(
        TestAssembly::new("sample-tests").with_collection_orderer("alphabetical"),
    );
    for name in ["first", "second"] {
        let collection = tree.collection(name);
        let class = class(&collection, "Tests");
        tree.passing(&class, "runs");
    }

    let mut options = serial_options();
    options.collection_orderer = None;
    let result = tree.run(options)?;

    assert_eq!(result.summary.total, 2);
    let diagnostics: Vec<_> = result
        .messages
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::Diagnostic { message } => Some(message.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(diagnostics.len(), 1, "diagnostics: {diagnostics:?}");
    assert!(diagnostics[0].contains("unknown collection orderer `alphabetical`"));
    assert!(diagnostics[0].contains("falling back to the default collection orderer"));
    result.check_structure()
}

#[test]
fn case_traits_are_reported() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Tagged");
    let method = Arc::new(TestMethod::new(&class, "runs", TestBody::new(|_| Ok(()))));
    tree.add(
        TestCase::fact(&method)
            .with_trait("category", "fast")
            .with_trait("category", "unit")
            .with_trait("owner", "storage"),
    );

    let result = tree.run(serial_options())?;

    let traits = result.messages.iter().find_map(|m| match &m.kind {
        MessageKind::CaseStarting { traits, .. } => Some(traits.clone()),
        _ => None,
    });
    let expected: BTreeMap<SmolStr, Vec<SmolStr>> = btreemap! {
        "category".into() => vec!["fast".into(), "unit".into()],
        "owner".into() => vec!["storage".into()],
    };
    assert_eq!(traits, Some(expected));
    Ok(())
}
