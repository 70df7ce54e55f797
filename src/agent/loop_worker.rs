use std::time::Instant;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{interval_at, Duration, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::errors::AgentError;

use super::bridge::InputEvent;
use super::context::{Agent, Flow};

// Set to true to enable verbose logging in this module
const ENABLE_LOGS: bool = true;

use crate::{log_error, log_info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A stop command was received.
    Stopped,
    /// The controller cancelled the loop.
    Cancelled,
    /// The input listener died.
    ListenerFailure,
}

pub struct LoopExit {
    pub reason: ExitReason,
    pub agent: Agent,
}

fn ticker(period: Duration) -> Interval {
    let mut ticker = interval_at(tokio::time::Instant::now(), period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Drives the agent until it is stopped, cancelled or loses its input
/// listener, then runs teardown. Scans happen on the ticker; queued input
/// events are always drained before the next scan starts.
pub async fn agent_loop(
    mut agent: Agent,
    mut events: UnboundedReceiver<InputEvent>,
    cancel_token: CancellationToken,
) -> LoopExit {
    let mut period = agent.scan_interval();
    let mut ticker = ticker(period);

    log_info!("Agent started: {}", agent.modes().describe());

    let reason = loop {
        tokio::select! {
            biased;

            _ = cancel_token.cancelled() => {
                log_info!("agent loop shutting down");
                break ExitReason::Cancelled;
            }
            event = events.recv() => {
                let Some(event) = event else {
                    log_error!("{}", AgentError::ListenerFailure("input channel closed".to_string()));
                    break ExitReason::ListenerFailure;
                };

                let listener_failed = matches!(event, InputEvent::ListenerFailed(_));
                if agent.handle_event(event).await == Flow::Stop {
                    break if listener_failed {
                        ExitReason::ListenerFailure
                    } else {
                        ExitReason::Stopped
                    };
                }
            }
            _ = ticker.tick() => {
                agent.tick(Instant::now()).await;
            }
        }

        let next = agent.scan_interval();
        if next != period {
            period = next;
            ticker = self::ticker(period);
        }
    };

    agent.teardown();
    LoopExit { reason, agent }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc::unbounded_channel;

    use crate::agent::commands::Command;
    use crate::agent::context::tests::{Harness, RecordingPrompt};
    use crate::agent::mode::Mode;
    use crate::errors::AgentResult;
    use crate::templates::{Template, Tier};
    use crate::vision::matcher::tests::noise;
    use crate::vision::matcher::{Frame, MatchResult, TemplateScorer};
    use crate::vision::region::Region;

    /// Reports a near miss on the first scan only.
    #[derive(Default)]
    struct FadingScorer {
        scans: AtomicUsize,
    }

    impl TemplateScorer for FadingScorer {
        fn best_match(&self, _frame: &Frame, template: &Template) -> AgentResult<Option<MatchResult>> {
            if self.scans.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(None);
            }
            Ok(Some(MatchResult {
                template_id: template.id.clone(),
                score: 0.78,
                region: Region::new(10, 10, 20, 10),
            }))
        }

        fn locate(&self, _frame: &Frame, _template: &Template) -> AgentResult<Option<MatchResult>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn stop_command_ends_the_loop_and_discards_observations() {
        let harness = Harness::new(noise(200, 100, 1));
        let mut agent = harness.agent();
        agent.apply_command(Command::SetMode(Mode::LearningOnly)).await;
        agent.on_manual_click(100, 50, Instant::now()).await;
        assert_eq!(agent.observations().pending().len(), 1);

        let (tx, rx) = unbounded_channel();
        let loop_task = tokio::spawn(agent_loop(agent, rx, CancellationToken::new()));
        tx.send(InputEvent::Command(Command::ForceStop)).unwrap();

        let exit = loop_task.await.unwrap();

        assert_eq!(exit.reason, ExitReason::Stopped);
        assert!(exit.agent.modes().is_stopped());
        assert!(exit.agent.observations().pending().is_empty());
        let pending_dir = exit.agent.store().dir(Tier::Pending);
        assert_eq!(std::fs::read_dir(pending_dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn queued_click_is_judged_against_the_scan_it_followed() {
        let harness = Harness::new(noise(200, 100, 3));
        noise(20, 10, 4)
            .save(harness.learned_dir().join("T1.png"))
            .unwrap();
        let prompt = Arc::new(RecordingPrompt::default());
        let mut agent = harness.agent_with(Arc::new(FadingScorer::default()), prompt.clone());
        agent.tick(Instant::now()).await;
        assert_eq!(agent.refinement().near_misses().len(), 1);

        // the loop's first tick is already due when these are queued
        let (tx, rx) = unbounded_channel();
        tx.send(InputEvent::Click {
            x: 15,
            y: 15,
            pressed: true,
            at: Instant::now(),
        })
        .unwrap();
        tx.send(InputEvent::Command(Command::ForceStop)).unwrap();

        let exit = agent_loop(agent, rx, CancellationToken::new()).await;

        assert_eq!(exit.reason, ExitReason::Stopped);
        let requests = prompt.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].near_miss.template_id, "T1");
    }

    #[tokio::test]
    async fn closed_input_channel_is_a_listener_failure() {
        let harness = Harness::new(noise(50, 50, 1));
        let (tx, rx) = unbounded_channel::<InputEvent>();
        drop(tx);

        let exit = agent_loop(harness.agent(), rx, CancellationToken::new()).await;

        assert_eq!(exit.reason, ExitReason::ListenerFailure);
    }

    #[tokio::test]
    async fn reported_listener_failure_stops_the_loop() {
        let harness = Harness::new(noise(50, 50, 1));
        let (tx, rx) = unbounded_channel();
        tx.send(InputEvent::ListenerFailed("hook lost".to_string())).unwrap();

        let exit = agent_loop(harness.agent(), rx, CancellationToken::new()).await;

        assert_eq!(exit.reason, ExitReason::ListenerFailure);
        assert!(exit.agent.modes().is_stopped());
    }

    #[tokio::test]
    async fn cancellation_is_observed() {
        let harness = Harness::new(noise(50, 50, 1));
        let (_tx, rx) = unbounded_channel::<InputEvent>();
        let token = CancellationToken::new();
        token.cancel();

        let exit = agent_loop(harness.agent(), rx, token).await;

        assert_eq!(exit.reason, ExitReason::Cancelled);
    }
}
