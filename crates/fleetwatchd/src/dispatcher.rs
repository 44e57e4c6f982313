//! Server command dispatch.
//!
//! Commands are fire-and-forget: the transport gets nothing back, outcomes
//! are only visible as progress events. Long-running commands run on their
//! own task so the transport keeps reading.

use crate::manager::{SessionOutcome, UpdateManager};
use crate::policy_store::PolicyStore;
use fleetwatch_common::{AgentCommand, InboundMessage, ProtocolError, WireMessage};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct CommandDispatcher {
    manager: Arc<UpdateManager>,
    policy: Arc<PolicyStore>,
}

impl CommandDispatcher {
    pub fn new(manager: Arc<UpdateManager>, policy: Arc<PolicyStore>) -> Self {
        Self { manager, policy }
    }

    /// Handle one raw JSON envelope.
    pub fn handle_raw(&self, raw: &str) -> Option<JoinHandle<()>> {
        self.handle_inbound(InboundMessage::parse(raw))
    }

    /// Handle one decoded envelope.
    pub fn handle_message(&self, message: WireMessage) -> Option<JoinHandle<()>> {
        self.handle_inbound(InboundMessage::from_wire(message))
    }

    /// Run `command`. Returns the background task, if one was started.
    pub fn dispatch(&self, command: AgentCommand) -> Option<JoinHandle<()>> {
        info!("Received command {}", command.name());
        match command {
            AgentCommand::CheckUpdate => {
                let manager = Arc::clone(&self.manager);
                Some(tokio::spawn(async move {
                    log_outcome("check_update", manager.check_now().await);
                }))
            }
            AgentCommand::CancelUpdate => {
                if !self.manager.cancel() {
                    info!("Nothing to cancel");
                }
                None
            }
            AgentCommand::ForceUpdate { reason } => {
                let manager = Arc::clone(&self.manager);
                Some(tokio::spawn(async move {
                    log_outcome("force_update", manager.force_install_latest(&reason).await);
                }))
            }
        }
    }

    fn handle_inbound(
        &self,
        parsed: Result<InboundMessage, ProtocolError>,
    ) -> Option<JoinHandle<()>> {
        match parsed {
            Ok(InboundMessage::Command(command)) => self.dispatch(command),
            Ok(InboundMessage::FleetPolicy(policy)) => {
                self.policy.set_fleet_policy(policy);
                None
            }
            Err(e) if e.is_unknown() => {
                warn!("Ignoring {}", e);
                None
            }
            Err(e) => {
                warn!("Dropping message: {}", e);
                None
            }
        }
    }
}

fn log_outcome(command: &str, outcome: Result<SessionOutcome, crate::error::UpdateError>) {
    match outcome {
        Ok(SessionOutcome::UpToDate) => debug!("{}: up to date", command),
        Ok(SessionOutcome::RestartPending { version }) => {
            info!("{}: installed {}, restart pending", command, version)
        }
        Err(e) if e.is_busy() => info!("{} ignored: {}", command, e),
        Err(e) => warn!("{} failed: {}", command, e),
    }
}
