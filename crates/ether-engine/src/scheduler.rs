//! Named timers owned by one controller.
//!
//! Each [`TimerKind`] has at most one live task.  Arming a kind replaces
//! (aborts) whatever was armed before, and `cancel_all` stops every timer in
//! one call.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    HealthPoll,
    MetadataPoll,
    ConnectionTimeout,
    Reconnect,
    Debounce,
}

#[derive(Default)]
pub struct Scheduler {
    tasks: Mutex<HashMap<TimerKind, JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    fn install(&self, kind: TimerKind, task: JoinHandle<()>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = tasks.insert(kind, task) {
            old.abort();
        }
    }

    /// Run `work` once after `delay`.
    pub fn arm<F>(&self, kind: TimerKind, delay: Duration, work: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!("scheduler: arm {:?} in {:?}", kind, delay);
        self.install(
            kind,
            tokio::spawn(async move {
                sleep(delay).await;
                work.await;
            }),
        );
    }

    /// Run `tick` every `period`, first after one full period.  The loop
    /// ends when `tick` returns `false`.
    pub fn every<F, Fut>(&self, kind: TimerKind, period: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        trace!("scheduler: every {:?} {:?}", period, kind);
        self.install(
            kind,
            tokio::spawn(async move {
                let mut ticker = interval_at(Instant::now() + period, period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    if !tick().await {
                        break;
                    }
                }
            }),
        );
    }

    pub fn cancel(&self, kind: TimerKind) {
        let task = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&kind);
        if let Some(task) = task {
            trace!("scheduler: cancel {:?}", kind);
            task.abort();
        }
    }

    pub fn cancel_all(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for (_, task) in tasks.drain() {
            task.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .is_some_and(|t| !t.is_finished())
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
