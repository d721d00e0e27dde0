//! Events drained by the network coordinator
//!
//! Everything the coordinator reacts to arrives as one of these, whether it
//! came from a radio, from the outside world or from one of its own timers.

use crate::transport::abstraction::{EndpointId, PeerId, RadioNotification, TransportError};
use std::fmt;

/// Synthetic events produced by scheduled wake-ups
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Periodic discovery cycle
    ScanCycle,
    /// A discovery window reached its deadline
    ScanWindowClosed { window_id: u64 },
    /// Sample RSSI on every served connection
    RssiTick,
    /// An analysis window for one peer reached its deadline
    AnalysisClosed { peer: PeerId, window_id: u64 },
    /// A connect attempt ran out of time
    ConnectTimeout {
        endpoint: EndpointId,
        peer: PeerId,
        attempt: u64,
    },
}

/// Input to the coordinator's single decision loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    /// A notification from one radio
    Radio {
        endpoint: EndpointId,
        notification: RadioNotification,
    },
    /// A radio channel opened (initially or after a reset)
    EndpointReady { endpoint: EndpointId },
    /// A radio channel failed
    EndpointFault {
        endpoint: EndpointId,
        error: TransportError,
    },
    /// External request to recover a disabled endpoint
    ResetEndpoint { endpoint: EndpointId },
    /// A scheduled wake-up fired
    Timer(TimerEvent),
    /// Stop the loop
    Shutdown,
}

impl fmt::Display for CoordinatorEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoordinatorEvent::Radio {
                endpoint,
                notification,
            } => write!(f, "{} {}", endpoint, notification),
            CoordinatorEvent::EndpointReady { endpoint } => write!(f, "{} ready", endpoint),
            CoordinatorEvent::EndpointFault { endpoint, error } => {
                write!(f, "{} fault: {}", endpoint, error)
            }
            CoordinatorEvent::ResetEndpoint { endpoint } => write!(f, "{} reset", endpoint),
            CoordinatorEvent::Timer(timer) => write!(f, "timer {:?}", timer),
            CoordinatorEvent::Shutdown => write!(f, "shutdown"),
        }
    }
}
