//! Actor identities, phases and messages

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::{RuntimeError, RuntimeResult};
use crate::kernel::{HostTensor, InferStage, StagePlan};
use crate::memory::DeviceTensor;

/// Stable actor address; equal to the node's index in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ActorId(pub usize);

impl ActorId {
    /// Sender id of messages the scheduler emits for graph inputs
    pub const SOURCE: ActorId = ActorId(usize::MAX);
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == ActorId::SOURCE {
            return f.write_str("source");
        }
        write!(f, "actor#{}", self.0)
    }
}

/// Behavior variant of a kernel actor
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ActorVariant {
    /// Plain kernel actor
    #[default]
    Compute,
    /// Waits for one remote message per run from `peer`
    Recv { peer: String },
    /// Accepts remote messages from any sender, one per run
    MuxRecv,
}

impl ActorVariant {
    pub fn receives_remote(&self) -> bool {
        !matches!(self, ActorVariant::Compute)
    }
}

/// Where an actor is inside one firing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ActorPhase {
    Idle,
    Inferring,
    Resizing,
    MemoryAllocating,
    Launching,
    MemoryFreeing,
    OutputSending,
}

impl ActorPhase {
    /// Allowed transitions; any phase may fall back to Idle on failure
    pub fn can_transition_to(self, next: ActorPhase) -> bool {
        use ActorPhase::*;
        matches!(
            (self, next),
            (_, Idle)
                | (Idle, Inferring)
                | (Idle, Resizing)
                | (Idle, MemoryAllocating)
                | (Inferring, Resizing)
                | (Resizing, MemoryAllocating)
                | (MemoryAllocating, Launching)
                | (Launching, MemoryFreeing)
                | (MemoryFreeing, OutputSending)
        )
    }

    /// First phase after Idle for a node with this stage plan
    pub fn entry(plan: StagePlan) -> ActorPhase {
        if plan.infer != InferStage::None {
            ActorPhase::Inferring
        } else if plan.resize {
            ActorPhase::Resizing
        } else {
            ActorPhase::MemoryAllocating
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActorPhase::Idle => "idle",
            ActorPhase::Inferring => "inferring",
            ActorPhase::Resizing => "resizing",
            ActorPhase::MemoryAllocating => "memory_allocating",
            ActorPhase::Launching => "launching",
            ActorPhase::MemoryFreeing => "memory_freeing",
            ActorPhase::OutputSending => "output_sending",
        }
    }
}

impl fmt::Display for ActorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated phase cursor for one actor
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    actor: String,
    phase: ActorPhase,
}

impl PhaseTracker {
    pub fn new(actor: &str) -> Self {
        PhaseTracker {
            actor: actor.to_string(),
            phase: ActorPhase::Idle,
        }
    }

    pub fn phase(&self) -> ActorPhase {
        self.phase
    }

    pub fn advance(&mut self, next: ActorPhase) -> RuntimeResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(RuntimeError::InvalidStateTransition {
                actor: self.actor.clone(),
                from: self.phase.to_string(),
                to: next.to_string(),
            });
        }
        self.phase = next;
        Ok(())
    }

    pub fn reset(&mut self) {
        self.phase = ActorPhase::Idle;
    }
}

/// Scheduling state of one actor for one op context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DispatchState {
    WaitingDependencies,
    Runnable,
    Running,
    Completed,
}

impl DispatchState {
    pub fn can_transition_to(self, next: DispatchState) -> bool {
        use DispatchState::*;
        matches!(
            (self, next),
            (WaitingDependencies, Runnable) | (Runnable, Running) | (Running, Completed)
        )
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Data arrow payload: one output device tensor for one input slot
#[derive(Debug, Clone)]
pub struct OpData {
    pub tensor: Arc<DeviceTensor>,
    pub index: usize,
    pub from: ActorId,
}

/// Control arrow payload
#[derive(Debug, Clone, Copy)]
pub struct OpControl {
    pub from: ActorId,
}

/// Payload posted to a receive actor by a remote sender
#[derive(Debug, Clone)]
pub struct RemoteMessage {
    pub from: String,
    pub payload: HostTensor,
}

/// Destination of an output data arrow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrowTarget {
    Actor { to: ActorId, slot: usize },
    /// Position in the graph's output list
    GraphOutput(usize),
}

/// Output data arrow of an actor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataArrow {
    pub from_output: usize,
    pub target: ArrowTarget,
}

/// Message produced by a completed firing, routed by the dispatcher
#[derive(Debug, Clone)]
pub enum Outgoing {
    Data { to: ActorId, data: OpData },
    Control { to: ActorId, control: OpControl },
    Output {
        position: usize,
        tensor: Arc<DeviceTensor>,
        from: ActorId,
    },
}
