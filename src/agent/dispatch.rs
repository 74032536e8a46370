//! Inbound dispatch: classify each message and run it in its own task.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Agent;
use crate::comm::InboundMessage;
use crate::config::BotConfig;
use crate::trigger::{classify, BotIdentity, Route};

/// Global counter of in-flight message tasks.
static IN_FLIGHT: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of message tasks currently executing.
pub fn in_flight_count() -> usize {
    IN_FLIGHT.load(Ordering::Relaxed)
}

/// Wait until all in-flight message tasks have completed, polling at a
/// fixed interval.  Returns after `timeout` even if tasks remain.
pub async fn drain_in_flight(timeout: Duration) {
    let start = std::time::Instant::now();
    loop {
        if IN_FLIGHT.load(Ordering::Relaxed) == 0 {
            break;
        }
        if start.elapsed() >= timeout {
            warn!(
                remaining = IN_FLIGHT.load(Ordering::Relaxed),
                "shutdown drain timeout reached, proceeding"
            );
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

struct InFlight;

impl InFlight {
    fn enter() -> Self {
        IN_FLIGHT.fetch_add(1, Ordering::Relaxed);
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        IN_FLIGHT.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Routes inbound messages to the orchestrator, the grammar check, or the
/// mock echo.
pub struct Dispatcher {
    agent: Arc<Agent>,
    bot: BotIdentity,
    settings: BotConfig,
}

impl Dispatcher {
    pub fn new(agent: Arc<Agent>, bot: BotIdentity, settings: BotConfig) -> Self {
        Self { agent, bot, settings }
    }

    pub fn bot(&self) -> &BotIdentity {
        &self.bot
    }

    /// Classify with a fresh random roll.
    pub fn route(&self, msg: &InboundMessage) -> Route {
        classify(&self.bot, msg, &self.settings, rand::random::<f64>())
    }

    /// Handle one message to completion along the given route.
    pub async fn handle(&self, msg: &InboundMessage, route: Route, cancel: &CancellationToken) {
        match route {
            Route::Converse => match self.agent.run_turn(msg, cancel).await {
                Ok(report) => debug!(
                    chat_id = msg.chat_id,
                    outcome = ?report.outcome,
                    duration_ms = report.duration_ms,
                    "conversation turn finished"
                ),
                Err(e) => warn!(chat_id = msg.chat_id, error = %e, "conversation turn failed"),
            },
            Route::Correct => {
                let outcome = self.agent.correct(msg, cancel).await;
                debug!(chat_id = msg.chat_id, outcome = ?outcome, "grammar check finished");
            }
            Route::Mock(text) => {
                debug!(chat_id = msg.chat_id, "sending mock reply");
                self.agent.reply(msg, &text).await;
            }
            Route::Ignore => {}
        }
    }

    /// Classify `msg` and, unless ignored, handle it in a spawned task
    /// tracked by the in-flight counter.
    pub fn spawn(self: &Arc<Self>, msg: InboundMessage, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        let route = self.route(&msg);
        if route == Route::Ignore {
            return None;
        }
        info!(chat_id = msg.chat_id, message_id = msg.message_id, route = ?route, "dispatching message");
        let this = Arc::clone(self);
        let guard = InFlight::enter();
        Some(tokio::spawn(async move {
            let _guard = guard;
            this.handle(&msg, route, &cancel).await;
        }))
    }
}
