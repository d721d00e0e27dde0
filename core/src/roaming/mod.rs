//! Roaming: discovery, assignment and handoff across the endpoint pool

pub mod assignment;
pub mod coordinator;
pub mod event;
pub mod handoff;
pub mod registry;
pub mod timers;
pub mod topology;

pub use assignment::{collect_candidates, greedy_assign, Candidate};
pub use coordinator::{NetworkCoordinator, RoamingNetwork};
pub use event::{CoordinatorEvent, TimerEvent};
pub use handoff::{
    should_handoff, AnalysisWindow, HandoffDecision, HandoffEngine, HandoffPolicy, SampleVerdict,
};
pub use registry::{BondingStatus, ConnectionState, PeripheralDevice, PeripheralRegistry, RssiSample};
pub use timers::TimerQueue;
pub use topology::{EndpointView, RoamEvent, ServedPeerView, TopologySnapshot};
