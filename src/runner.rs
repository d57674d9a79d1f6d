//! Virtual User Runner: one simulated client repeating the scenario.

use std::{
    any::Any,
    future::Future,
    marker::PhantomData,
    panic::AssertUnwindSafe,
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use tokio::{sync::watch::Receiver, time::Instant};

use crate::{
    error::IterationFault,
    metric::{Sample, ITERATIONS, ITERATION_CHECK, ITERATION_DURATION, ITERATION_ERRORS},
    scenario::{ScenarioResult, VuContext},
    sink::MetricSink,
};

/// Resolves once `rx` reads `true`. A dropped sender never fires.
pub(crate) async fn signalled(rx: &mut Receiver<bool>) {
    if rx.wait_for(|v| *v).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A virtual user: runs iterations of the scenario until retired or cancelled.
///
/// Retirement and cancellation are cooperative. They are checked before every
/// iteration and interrupt the pause between iterations, but an iteration that
/// has started always runs to completion.
pub struct VirtualUser<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send,
{
    id: usize,
    scenario: Arc<str>,
    action: F,
    pause: Option<Duration>,
    sink: MetricSink,
    output: PhantomData<fn() -> Fut>,
}

impl<F, Fut> VirtualUser<F, Fut>
where
    F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ScenarioResult> + Send,
{
    pub fn new(
        id: usize,
        scenario: Arc<str>,
        action: F,
        pause: Option<Duration>,
        sink: MetricSink,
    ) -> Self {
        Self {
            id,
            scenario,
            action,
            pause,
            sink,
            output: PhantomData,
        }
    }

    /// Loop until `retire` or `cancel` flips to `true`. Returns the number of
    /// iterations completed.
    pub async fn run(self, mut retire: Receiver<bool>, mut cancel: Receiver<bool>) -> u64 {
        tracing::debug!("VU {} started.", self.id);
        let mut iterations = 0;

        loop {
            if *retire.borrow() || *cancel.borrow() {
                break;
            }

            let requested = self.iterate(iterations).await;
            iterations += 1;

            match requested.or(self.pause).filter(|p| !p.is_zero()) {
                Some(pause) => {
                    tokio::select! {
                        _ = tokio::time::sleep(pause) => {}
                        _ = signalled(&mut retire) => break,
                        _ = signalled(&mut cancel) => break,
                    }
                }
                // Scenarios that never await would otherwise hog the worker thread
                None => tokio::task::yield_now().await,
            }
        }

        tracing::debug!("VU {} stopping after {iterations} iterations.", self.id);
        iterations
    }

    /// Run a single iteration and return the pause it asked for.
    pub async fn iterate(&self, iteration: u64) -> Option<Duration> {
        let ctx = VuContext::new(self.id, iteration, Arc::clone(&self.scenario), self.sink.clone());

        let start = Instant::now();
        let outcome = AssertUnwindSafe(async { (self.action)(ctx.clone()).await })
            .catch_unwind()
            .await;
        let elapsed = start.elapsed();

        self.sink
            .record(Sample::duration(ITERATION_DURATION, elapsed).with_tag(&*self.scenario));
        self.sink.add(ITERATIONS, 1.0);

        let fault = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(IterationFault::Failed(e)),
            Err(panic) => Some(IterationFault::Panicked(panic_message(panic))),
        };
        if let Some(fault) = fault {
            tracing::debug!(vu = self.id, iteration, "Iteration faulted: {fault}");
            self.sink.check(ITERATION_CHECK, false);
            self.sink.add(ITERATION_ERRORS, 1.0);
        }

        ctx.requested_pause()
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tokio::sync::watch;

    use super::*;
    use crate::{
        error::BoxError,
        metric::CHECKS,
        sink::{CheckTally, MetricSummary},
    };

    fn vu<F, Fut>(action: F, sink: &MetricSink) -> VirtualUser<F, Fut>
    where
        F: Fn(VuContext) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = ScenarioResult> + Send,
    {
        VirtualUser::new(0, Arc::from("test"), action, None, sink.clone())
    }

    fn counter(sink: &MetricSink, name: &str) -> f64 {
        match sink.snapshot().get(name).map(|m| m.summary()) {
            Some(MetricSummary::Counter { total, .. }) => total,
            _ => 0.0,
        }
    }

    #[tokio::test]
    async fn iteration_records_duration_and_count() {
        let sink = MetricSink::new();
        let user = vu(|_ctx| async { Ok(()) }, &sink);
        assert_eq!(user.iterate(0).await, None);

        let snap = sink.snapshot();
        let durations = snap.get(ITERATION_DURATION).unwrap();
        assert_eq!(durations.all.count(), 1);
        assert_eq!(durations.tagged.get("test").unwrap().count(), 1);
        assert_eq!(counter(&sink, ITERATIONS), 1.0);
        assert!(snap.get(CHECKS).is_none());
    }

    #[tokio::test]
    async fn errors_become_failed_checks() {
        let sink = MetricSink::new();
        let user = vu(
            |_ctx| async { Err::<(), BoxError>("boom".into()) },
            &sink,
        );
        user.iterate(0).await;
        user.iterate(1).await;

        assert_eq!(counter(&sink, ITERATION_ERRORS), 2.0);
        assert_eq!(
            sink.snapshot().checks(),
            vec![CheckTally {
                label: ITERATION_CHECK.into(),
                passes: 0,
                fails: 2
            }]
        );
    }

    #[tokio::test]
    async fn panics_are_absorbed() {
        let sink = MetricSink::new();
        let user = vu(
            |ctx: VuContext| async move {
                if ctx.iteration() == 0 {
                    panic!("scenario bug");
                }
                Ok(())
            },
            &sink,
        );
        user.iterate(0).await;
        user.iterate(1).await;
        assert_eq!(counter(&sink, ITERATIONS), 2.0);
        assert_eq!(counter(&sink, ITERATION_ERRORS), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn pause_is_interrupted_by_retirement() {
        let sink = MetricSink::new();
        let user = vu(
            |ctx: VuContext| async move {
                ctx.sleep(Duration::from_secs(3600));
                Ok(())
            },
            &sink,
        );
        let (retire_tx, retire_rx) = watch::channel(false);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let started = Instant::now();
        let handle = tokio::spawn(user.run(retire_rx, cancel_rx));
        tokio::time::sleep(Duration::from_secs(5)).await;
        retire_tx.send_replace(true);

        assert_eq!(handle.await.unwrap(), 1);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn retirement_waits_for_the_running_iteration() {
        let sink = MetricSink::new();
        let finished = Arc::new(AtomicU64::new(0));
        let done = Arc::clone(&finished);
        let user = vu(
            move |_ctx| {
                let done = Arc::clone(&done);
                async move {
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    done.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
            &sink,
        );
        let (retire_tx, retire_rx) = watch::channel(false);
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(user.run(retire_rx, cancel_rx));
        // retire in the middle of the third iteration
        tokio::time::sleep(Duration::from_secs(5)).await;
        retire_tx.send_replace(true);

        let iterations = handle.await.unwrap();
        assert_eq!(iterations, 3);
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let sink = MetricSink::new();
        let user = VirtualUser::new(
            1,
            Arc::from("paced"),
            |_ctx| async { Ok(()) },
            Some(Duration::from_secs(1)),
            sink.clone(),
        );
        let (_retire_tx, retire_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let handle = tokio::spawn(user.run(retire_rx, cancel_rx));
        tokio::time::sleep(Duration::from_millis(2500)).await;
        cancel_tx.send_replace(true);

        assert_eq!(handle.await.unwrap(), 3);
        assert_eq!(counter(&sink, ITERATIONS), 3.0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_senders_do_not_stop_the_user() {
        let sink = MetricSink::new();
        let user = VirtualUser::new(
            2,
            Arc::from("orphan"),
            |_ctx| async { Ok(()) },
            Some(Duration::from_secs(1)),
            sink.clone(),
        );
        let (retire_tx, retire_rx) = watch::channel(false);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        drop(cancel_tx);

        let handle = tokio::spawn(user.run(retire_rx, cancel_rx));
        tokio::time::sleep(Duration::from_millis(4500)).await;
        retire_tx.send_replace(true);
        assert_eq!(handle.await.unwrap(), 5);
    }
}
