// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use crate::fixtures::*;
use color_eyre::eyre::Result;
use pretty_assertions::assert_eq;
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use test_case::test_case;
use trellis_metadata::MessageKind;
use trellis_runner::{
    aggregator::CapturedError,
    fixture::{Fixture, FixtureDefinition, Parameter, Teardown},
    list::{
        BeforeAfterHook, CollectionDefinition, DataRow, TestArgument, TestAssembly, TestBody,
        TestCase, TestClass, TestMethod, TheoryData,
    },
};

type Log = Arc<Mutex<Vec<String>>>;

fn record(log: &Log, entry: impl Into<String>) {
    log.lock().unwrap().push(entry.into());
}

fn logging_hook(log: &Log, name: &str) -> BeforeAfterHook {
    let before_log = log.clone();
    let after_log = log.clone();
    let before = format!("before {name}");
    let after = format!("after {name}");
    BeforeAfterHook::new(name)
        .with_before(move |_| {
            record(&before_log, before.clone());
            Ok(())
        })
        .with_after(move |_| {
            record(&after_log, after.clone());
            Ok(())
        })
}

#[test]
fn single_test_message_order() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Only");
    tree.passing(&class, "test");

    let result = tree.run(serial_options())?;

    assert_eq!(
        result.names(),
        vec![
            "assembly-starting",
            "collection-starting",
            "class-starting",
            "method-starting",
            "case-starting",
            "test-starting",
            "test-passed",
            "test-finished",
            "case-finished",
            "method-finished",
            "class-finished",
            "collection-finished",
            "assembly-finished",
        ]
    );
    result.check_structure()
}

#[derive(Debug)]
struct Instance {
    id: usize,
}

#[test]
fn hooks_and_instance_lifecycle() -> Result<()> {
    let log: Log = Arc::default();
    let next_id = Arc::new(AtomicUsize::new(0));

    let constructor = {
        let log = log.clone();
        FixtureDefinition::new::<Instance>().with_constructor(Vec::new(), move |_| {
            let id = next_id.fetch_add(1, Ordering::SeqCst);
            record(&log, format!("construct {id}"));
            let log = log.clone();
            Ok(Fixture::new(Instance { id }).with_teardown(Teardown::new().with_sync(move || {
                record(&log, format!("dispose {id}"));
                Ok(())
            })))
        })
    };

    let mut tree = TreeBuilder::with_assembly(
        TestAssembly::new("sample-tests").with_before_after(logging_hook(&log, "assembly")),
    );
    let collection = tree.collection("default");
    let class = Arc::new(
        TestClass::new(&collection, "Hooked")
            .with_constructor(constructor)
            .with_before_after(logging_hook(&log, "class")),
    );
    let body_log = log.clone();
    let method = Arc::new(
        TestMethod::new(
            &class,
            "runs",
            TestBody::new(move |cx| {
                let instance = cx
                    .instance::<Instance>()
                    .ok_or_else(|| CapturedError::msg("no instance"))?;
                record(&body_log, format!("body {}", instance.id));
                Ok(())
            }),
        )
        .with_before_after(logging_hook(&log, "method")),
    );
    tree.add(TestCase::fact(&method));
    tree.add(TestCase::data_row(&method, vec![TestArgument::new(1)]));

    let result = tree.run(serial_options())?;

    assert_eq!(result.failures(), Vec::new());
    let expected: Vec<String> = (0..2)
        .flat_map(|id| {
            [
                format!("construct {id}"),
                "before assembly".to_owned(),
                "before class".to_owned(),
                "before method".to_owned(),
                format!("body {id}"),
                "after method".to_owned(),
                "after class".to_owned(),
                "after assembly".to_owned(),
                format!("dispose {id}"),
            ]
        })
        .collect();
    assert_eq!(*log.lock().unwrap(), expected);

    assert_eq!(
        result.count(|k| matches!(k, MessageKind::TestClassConstructionStarting)),
        2
    );
    assert_eq!(
        result.count(|k| matches!(k, MessageKind::TestClassDisposeFinished)),
        2
    );
    let hooks: Vec<_> = result
        .messages
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::BeforeTestStarting { hook } => Some(format!("+{hook}")),
            MessageKind::AfterTestStarting { hook } => Some(format!("-{hook}")),
            _ => None,
        })
        .take(6)
        .collect();
    assert_eq!(
        hooks,
        vec!["+assembly", "+class", "+method", "-method", "-class", "-assembly"]
    );
    result.check_structure()
}

#[test]
fn failing_before_hook_skips_body_and_later_hooks() -> Result<()> {
    let log: Log = Arc::default();
    let failing = {
        let log = log.clone();
        BeforeAfterHook::new("class")
            .with_before(|_| Err(CapturedError::msg("setup failed")))
            .with_after(move |_| {
                record(&log, "after class");
                Ok(())
            })
    };

    let mut tree = TreeBuilder::with_assembly(
        TestAssembly::new("sample-tests").with_before_after(logging_hook(&log, "assembly")),
    );
    let collection = tree.collection("default");
    let class = Arc::new(TestClass::new(&collection, "Hooked").with_before_after(failing));
    let body_log = log.clone();
    let method = Arc::new(
        TestMethod::new(
            &class,
            "runs",
            TestBody::new(move |_| {
                record(&body_log, "body");
                Ok(())
            }),
        )
        .with_before_after(logging_hook(&log, "method")),
    );
    tree.add(TestCase::fact(&method));

    let result = tree.run(serial_options())?;

    assert_eq!(
        *log.lock().unwrap(),
        vec!["before assembly", "after class", "after assembly"]
    );
    assert_eq!(
        result.failures(),
        vec![("Hooked.runs".to_owned(), vec!["setup failed".to_owned()])]
    );
    result.check_structure()
}

#[test]
fn failing_instance_dispose_is_a_cleanup_failure() -> Result<()> {
    let constructor = FixtureDefinition::new::<Instance>().with_constructor(Vec::new(), |_| {
        Ok(Fixture::new(Instance { id: 0 }).with_teardown(
            Teardown::new().with_sync(|| Err(CapturedError::msg("dispose failed"))),
        ))
    });

    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = Arc::new(TestClass::new(&collection, "Leaky").with_constructor(constructor));
    tree.passing(&class, "runs");

    let result = tree.run(serial_options())?;

    assert_eq!((result.summary.total, result.summary.failed), (1, 0));
    let names = result.names();
    let passed = names.iter().position(|n| *n == "test-passed");
    let cleanup = names.iter().position(|n| *n == "test-cleanup-failure");
    let finished = names.iter().position(|n| *n == "test-finished");
    assert!(passed.is_some() && passed < cleanup && cleanup < finished);
    result.check_structure()
}

#[derive(Debug)]
struct Database {
    url: &'static str,
}

#[derive(Debug)]
struct Cache {
    backing: &'static str,
}

fn cache_fixture() -> FixtureDefinition {
    FixtureDefinition::new::<Cache>().with_constructor(
        vec![Parameter::of::<Database>("database")],
        |args| {
            let database = args
                .get::<Database>(0)
                .ok_or_else(|| CapturedError::msg("database argument missing"))?;
            Ok(Fixture::new(Cache {
                backing: database.url,
            }))
        },
    )
}

#[test]
fn class_fixture_receives_collection_fixture() -> Result<()> {
    let definition = CollectionDefinition::new("DatabaseCollection").with_fixture(
        FixtureDefinition::from_fn(|| Ok(Database { url: "sqlite::memory:" })),
    );

    let mut tree = TreeBuilder::new();
    let collection = tree.defined_collection("database", definition);
    let class = Arc::new(TestClass::new(&collection, "CacheTests").with_class_fixture(cache_fixture()));
    tree.fact(&class, "uses_cache", |cx| {
        let cache = cx
            .class_fixture::<Cache>()
            .ok_or_else(|| CapturedError::msg("no cache"))?;
        if cache.backing != "sqlite::memory:" {
            return Err(CapturedError::msg(format!("wrong backing {}", cache.backing)));
        }
        Ok(())
    });

    let result = tree.run(serial_options())?;

    assert_eq!(result.failures(), Vec::new());
    assert_eq!(result.summary.total, 1);
    result.check_structure()
}

#[test]
fn unresolved_class_fixture_fails_every_test() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = Arc::new(TestClass::new(&collection, "CacheTests").with_class_fixture(cache_fixture()));
    tree.passing(&class, "first");
    tree.passing(&class, "second");

    let result = tree.run(serial_options())?;

    let failures = result.failures();
    assert_eq!(failures.len(), 2);
    for (_, messages) in &failures {
        assert!(
            messages[0].starts_with("Class fixture type")
                && messages[0]
                    .contains("had one or more unresolved constructor arguments:")
                && messages[0].ends_with("Database database"),
            "unexpected message: {}",
            messages[0]
        );
    }
    result.check_structure()
}

#[test]
fn data_rows_receive_arguments() -> Result<()> {
    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Arithmetic");
    let method = Arc::new(TestMethod::new(
        &class,
        "is_even",
        TestBody::new(|cx| match cx.argument::<i32>(0) {
            Some(n) if n % 2 == 0 => Ok(()),
            Some(n) => Err(CapturedError::msg(format!("{n} is odd"))),
            None => Err(CapturedError::msg("missing argument")),
        }),
    ));
    for n in [2, 3, 4] {
        tree.add(TestCase::data_row(&method, vec![TestArgument::new(n)]));
    }

    let result = tree.run(serial_options())?;

    assert_eq!(
        result.failures(),
        vec![(
            "Arithmetic.is_even(3)".to_owned(),
            vec!["3 is odd".to_owned()]
        )]
    );
    assert_eq!(result.summary.total, 3);
    result.check_structure()
}

#[test]
fn theory_rows_run_as_tests() -> Result<()> {
    let torn_down = Arc::new(AtomicUsize::new(0));
    let data = {
        let torn_down = torn_down.clone();
        TheoryData::new(move || {
            let counted = |n: u32| {
                let torn_down = torn_down.clone();
                DataRow::new(vec![TestArgument::new(n)]).with_teardown(Teardown::new().with_sync(
                    move || {
                        torn_down.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    },
                ))
            };
            Ok(vec![
                counted(1),
                counted(2),
                DataRow::new(vec![TestArgument::new(3u32)]).with_skip_reason("flaky"),
                DataRow::new(vec![TestArgument::new(10u32)]).with_display_name("large input"),
                DataRow::new(vec![TestArgument::new(4u32)]).with_teardown(
                    Teardown::new().with_sync(|| Err(CapturedError::msg("row teardown failed"))),
                ),
            ])
        })
    };

    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Theories");
    let method = Arc::new(TestMethod::new(
        &class,
        "small",
        TestBody::new(|cx| match cx.argument::<u32>(0) {
            Some(n) if *n < 5 => Ok(()),
            Some(n) => Err(CapturedError::msg(format!("{n} is too large"))),
            None => Err(CapturedError::msg("missing argument")),
        }),
    ));
    tree.add(TestCase::theory(&method, data));

    let result = tree.run(serial_options())?;

    let started: Vec<_> = result
        .messages
        .iter()
        .filter_map(|m| match &m.kind {
            MessageKind::TestStarting { display_name } => Some(display_name.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(
        started,
        vec![
            "Theories.small(1)",
            "Theories.small(2)",
            "Theories.small(3)",
            "large input",
            "Theories.small(4)",
        ]
    );
    assert_eq!(
        result.failures(),
        vec![("large input".to_owned(), vec!["10 is too large".to_owned()])]
    );
    assert_eq!(
        (result.summary.total, result.summary.failed, result.summary.skipped),
        (5, 1, 1)
    );
    assert_eq!(torn_down.load(Ordering::SeqCst), 2);
    assert_eq!(
        result.count(|k| matches!(k, MessageKind::CaseCleanupFailure { .. })),
        1
    );
    result.check_structure()
}

#[test_case(
    Ok(Vec::new()),
    "No data found for Theories.check"
    ; "no rows"
)]
#[test_case(
    Err("data source offline"),
    "data source offline"
    ; "enumeration error"
)]
fn theory_without_rows_fails_once(rows: Result<Vec<u32>, &'static str>, expected: &str) -> Result<()> {
    let data = TheoryData::new(move || match &rows {
        Ok(rows) => Ok(rows
            .iter()
            .map(|n| DataRow::new(vec![TestArgument::new(*n)]))
            .collect()),
        Err(message) => Err(CapturedError::msg(*message)),
    });

    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Theories");
    let method = Arc::new(TestMethod::new(&class, "check", TestBody::new(|_| Ok(()))));
    tree.add(TestCase::theory(&method, data));

    let result = tree.run(serial_options())?;

    assert_eq!(
        result.failures(),
        vec![("Theories.check".to_owned(), vec![expected.to_owned()])]
    );
    assert_eq!((result.summary.total, result.summary.failed), (1, 1));
    result.check_structure()
}

#[test]
fn skipped_theory_is_not_enumerated() -> Result<()> {
    let enumerated = Arc::new(AtomicBool::new(false));
    let data = {
        let enumerated = enumerated.clone();
        TheoryData::new(move || {
            enumerated.store(true, Ordering::SeqCst);
            Ok(vec![DataRow::new(vec![TestArgument::new(1)])])
        })
    };

    let mut tree = TreeBuilder::new();
    let collection = tree.collection("default");
    let class = class(&collection, "Theories");
    let method = Arc::new(TestMethod::new(&class, "check", TestBody::new(|_| Ok(()))));
    tree.add(TestCase::theory(&method, data).with_skip_reason("not ready"));

    let result = tree.run(serial_options())?;

    assert!(!enumerated.load(Ordering::SeqCst));
    assert_eq!(
        (result.summary.total, result.summary.skipped),
        (1, 1)
    );
    result.check_structure()
}
