//! Edge-armed flush timer
//!
//! A timer fires once per arming: producers call [`FlushTimer::arm`] after
//! enqueuing, the background loop sleeps until the deadline, disarms and runs
//! the handler. Nothing fires again until new activity re-arms it.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::notifications::{AdapterExceptionEvent, Event, SharedEventBus};
use crate::shared::SharedClock;

pub struct FlushTimer {
    name: &'static str,
    deadline: watch::Sender<Option<Instant>>,
}

impl FlushTimer {
    pub fn new(name: &'static str) -> Self {
        let (deadline, _) = watch::channel(None);
        Self { name, deadline }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Schedule a fire after `delay`; a sooner pending deadline is kept.
    pub fn arm(&self, delay: Duration) {
        let at = Instant::now() + delay;
        let armed = self.deadline.send_if_modified(|current| match current {
            Some(existing) if *existing <= at => false,
            _ => {
                *current = Some(at);
                true
            }
        });
        if armed {
            debug!(timer = self.name, delay_ms = delay.as_millis() as u64, "Timer armed");
        }
    }

    pub fn disarm(&self) {
        self.deadline.send_replace(None);
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.borrow().is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        *self.deadline.borrow()
    }

    /// Run the timer loop until `cancel` fires.
    ///
    /// A panicking handler is caught and published as an adapter exception;
    /// the loop keeps running.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        cancel: CancellationToken,
        events: SharedEventBus,
        clock: SharedClock,
        handler: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let timer = self.clone();

        tokio::spawn(async move {
            let mut rx = timer.deadline.subscribe();
            info!(timer = timer.name, "Flush timer started");

            loop {
                let next = *rx.borrow_and_update();
                let fire = match next {
                    None => tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            false
                        }
                    },
                    Some(at) => tokio::select! {
                        _ = cancel.cancelled() => break,
                        changed = rx.changed() => {
                            if changed.is_err() {
                                break;
                            }
                            false
                        }
                        _ = tokio::time::sleep_until(at) => true,
                    },
                };

                if !fire {
                    continue;
                }

                timer.disarm();
                rx.borrow_and_update();

                if let Err(panic) = AssertUnwindSafe(handler()).catch_unwind().await {
                    let message = panic_message(panic.as_ref());
                    error!(timer = timer.name, %message, "Flush handler panicked");
                    events.publish(Event::AdapterException(AdapterExceptionEvent {
                        source: timer.name.to_string(),
                        message,
                        timestamp: clock.now(),
                    }));
                }
            }

            info!(timer = timer.name, "Flush timer stopped");
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
