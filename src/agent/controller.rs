use anyhow::{bail, Context, Result};
use log::info;
use tokio::sync::mpsc::unbounded_channel;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::bridge::{InputSource, ListenerHandle};
use super::context::Agent;
use super::loop_worker::{agent_loop, LoopExit};

/// Owns the running agent loop and the input listener feeding it.
pub struct AgentController {
    handle: Option<JoinHandle<LoopExit>>,
    cancel_token: Option<CancellationToken>,
    listener: Option<Box<dyn ListenerHandle>>,
}

impl Default for AgentController {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentController {
    pub fn new() -> Self {
        Self {
            handle: None,
            cancel_token: None,
            listener: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start(&mut self, agent: Agent, input: &mut dyn InputSource) -> Result<()> {
        if self.handle.is_some() {
            bail!("agent already running");
        }

        let (events_tx, events_rx) = unbounded_channel();
        let listener = input
            .subscribe(events_tx)
            .context("failed to start the input listener")?;

        let cancel_token = CancellationToken::new();
        let handle = tokio::spawn(agent_loop(agent, events_rx, cancel_token.clone()));

        self.handle = Some(handle);
        self.cancel_token = Some(cancel_token);
        self.listener = Some(listener);
        Ok(())
    }

    /// Waits for the loop to finish on its own and detaches the listener.
    pub async fn wait(&mut self) -> Result<Option<LoopExit>> {
        // the handle stays in place until the join completes, so dropping
        // this future early does not detach the loop
        let exit = match self.handle.as_mut() {
            Some(handle) => {
                let joined = handle.await;
                self.handle = None;
                Some(joined.context("agent loop task failed to join")?)
            }
            None => None,
        };

        self.cancel_token = None;
        if let Some(mut listener) = self.listener.take() {
            listener.stop();
            info!("Input listener detached");
        }
        Ok(exit)
    }

    pub async fn stop(&mut self) -> Result<Option<LoopExit>> {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        self.wait().await
    }
}
