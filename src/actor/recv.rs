//! Variant-specific actor behavior
//!
//! A [`KernelActor`](super::KernelActor) delegates the few points where
//! compute and receive actors differ to an [`ActorBehavior`]: validating its
//! input layout, accepting remote messages, and bookkeeping of the sender
//! around each firing.

use std::fmt;

use tracing::debug;

use super::types::{ActorVariant, RemoteMessage};
use crate::error::{RuntimeError, RuntimeResult};
use crate::graph::InputSource;

/// Sender bookkeeping of a receive actor
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoteState {
    /// Sender of the message accepted for the pending firing
    pub received_from: Option<String>,
    /// Sender of the message consumed by the last firing
    pub from_actor: Option<String>,
}

pub trait ActorBehavior: Send + Sync + fmt::Debug {
    /// Remote messages required per firing
    fn remote_inputs(&self) -> usize {
        0
    }

    /// Check the node's input layout
    fn on_init(&self, node: &str, inputs: &[InputSource]) -> RuntimeResult<()>;

    /// Accept or reject a remote message
    fn on_message(&self, node: &str, message: &RemoteMessage) -> RuntimeResult<()>;

    /// Called when a firing consumes its remote input
    fn on_run(&self, _remote: &mut RemoteState) {}

    /// Called when the context's input state is erased
    fn on_clear(&self, remote: &mut RemoteState) {
        *remote = RemoteState::default();
    }
}

pub fn behavior_for(variant: &ActorVariant) -> Box<dyn ActorBehavior> {
    match variant {
        ActorVariant::Compute => Box::new(Compute),
        ActorVariant::Recv { peer } => Box::new(Recv { peer: peer.clone() }),
        ActorVariant::MuxRecv => Box::new(MuxRecv),
    }
}

fn remote_slots(inputs: &[InputSource]) -> Vec<usize> {
    inputs
        .iter()
        .enumerate()
        .filter(|(_, s)| matches!(s, InputSource::Remote))
        .map(|(i, _)| i)
        .collect()
}

/// Receive actors take exactly one remote input, in slot 0
fn check_receive_layout(node: &str, inputs: &[InputSource]) -> RuntimeResult<()> {
    let slots = remote_slots(inputs);
    if slots != [0] {
        return Err(RuntimeError::InvalidConfiguration(format!(
            "receive actor {} needs exactly one remote input in slot 0, found slots {:?}",
            node, slots
        )));
    }
    Ok(())
}

#[derive(Debug)]
struct Compute;

impl ActorBehavior for Compute {
    fn on_init(&self, node: &str, inputs: &[InputSource]) -> RuntimeResult<()> {
        let slots = remote_slots(inputs);
        if !slots.is_empty() {
            return Err(RuntimeError::InvalidConfiguration(format!(
                "compute actor {} has remote input slots {:?}",
                node, slots
            )));
        }
        Ok(())
    }

    fn on_message(&self, node: &str, message: &RemoteMessage) -> RuntimeResult<()> {
        Err(RuntimeError::MessageRejected {
            actor: node.to_string(),
            from: message.from.clone(),
            reason: "not a receive actor".to_string(),
        })
    }
}

#[derive(Debug)]
struct Recv {
    peer: String,
}

impl ActorBehavior for Recv {
    fn remote_inputs(&self) -> usize {
        1
    }

    fn on_init(&self, node: &str, inputs: &[InputSource]) -> RuntimeResult<()> {
        check_receive_layout(node, inputs)
    }

    fn on_message(&self, node: &str, message: &RemoteMessage) -> RuntimeResult<()> {
        if message.from != self.peer {
            return Err(RuntimeError::MessageRejected {
                actor: node.to_string(),
                from: message.from.clone(),
                reason: format!("expected peer {}", self.peer),
            });
        }
        Ok(())
    }

    fn on_run(&self, remote: &mut RemoteState) {
        remote.from_actor = remote.received_from.take();
    }
}

#[derive(Debug)]
struct MuxRecv;

impl ActorBehavior for MuxRecv {
    fn remote_inputs(&self) -> usize {
        1
    }

    fn on_init(&self, node: &str, inputs: &[InputSource]) -> RuntimeResult<()> {
        check_receive_layout(node, inputs)
    }

    fn on_message(&self, node: &str, message: &RemoteMessage) -> RuntimeResult<()> {
        debug!(actor = node, from = %message.from, "mux receive accepted message");
        Ok(())
    }

    fn on_run(&self, remote: &mut RemoteState) {
        remote.from_actor = remote.received_from.take();
    }

    // Sender survives context erasure
    fn on_clear(&self, remote: &mut RemoteState) {
        remote.received_from = None;
    }
}
