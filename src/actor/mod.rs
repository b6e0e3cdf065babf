//! Kernel actors and the per-run op context

pub mod callback;
pub mod context;
pub mod kernel_actor;
pub mod output;
pub mod recv;
pub mod types;

pub use callback::CallbackCounter;
pub use context::{InFlightGuard, OpContext};
pub use kernel_actor::{ActorEnv, ActorWiring, KernelActor, RemoteDelivery};
pub use output::OutputCollector;
pub use recv::{behavior_for, ActorBehavior, RemoteState};
pub use types::{
    ActorId, ActorPhase, ActorVariant, ArrowTarget, DataArrow, DispatchState, OpControl, OpData,
    Outgoing, PhaseTracker, RemoteMessage,
};
