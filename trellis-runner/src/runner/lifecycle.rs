// Copyright (c) The trellis Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use super::AssemblyContext;
use crate::aggregator::ExceptionAggregator;
use tracing::debug;
use trellis_metadata::{ErrorMetadata, MessageKind, NodeIds, RunSummary};

/// One level of the runner chain: assembly, collection, class, method or case.
///
/// Hooks never fail. Errors are captured in the level's aggregator instead.
pub(super) trait NodeRunner {
    fn ids(&self) -> &NodeIds;

    fn aggregator(&mut self) -> &mut ExceptionAggregator;

    fn starting_message(&self) -> MessageKind;

    fn finished_message(&self, summary: RunSummary) -> MessageKind;

    fn cleanup_failure_message(&self, error: ErrorMetadata) -> MessageKind;

    /// Sets up state shared by the children, such as fixtures.
    fn after_starting(&mut self) {}

    fn run_children(&mut self) -> RunSummary;

    /// Tears down what `after_starting` set up.
    fn before_finished(&mut self) {}

    /// Adjusts the summary reported in the finished message.
    fn finish_summary(&self, summary: RunSummary) -> RunSummary {
        summary
    }
}

/// Drives `runner` through its lifecycle:
///
/// `Starting → after_starting → run_children → clear aggregator → before_finished →
/// [CleanupFailure] → Finished`.
///
/// If the sink asks to stop on the starting message, everything but the finished message is
/// skipped and the summary is empty.
pub(super) fn run_lifecycle(cx: &AssemblyContext, runner: &mut impl NodeRunner) -> RunSummary {
    let ids = runner.ids().clone();
    let level = ids.level();

    let mut summary = RunSummary::default();
    if cx.queue(&ids, runner.starting_message()) {
        debug!(%level, node = ids.node_id(), "started");
        runner.after_starting();
        summary = runner.run_children();

        runner.aggregator().clear();
        runner.before_finished();
        if let Some(error) = runner.aggregator().to_error() {
            debug!(%level, node = ids.node_id(), "cleanup failed: {error}");
            cx.queue(&ids, runner.cleanup_failure_message(error.to_error_metadata()));
        }
    } else {
        debug!(%level, node = ids.node_id(), "cancelled on start");
    }

    let summary = runner.finish_summary(summary);
    cx.queue(&ids, runner.finished_message(summary));
    debug!(
        %level,
        node = ids.node_id(),
        total = summary.total,
        failed = summary.failed,
        skipped = summary.skipped,
        "finished"
    );
    summary
}
