// Transport module: radio endpoints and the channel abstraction behind them

pub mod abstraction;
pub mod ble;
pub mod endpoint;
pub mod loopback;

pub use abstraction::{
    AddressType, BondingFailure, CloseReason, ConnectionHandle, EndpointId, KeyMaterial,
    PeerAddress, PeerId, RadioCommand, RadioNotification, ScanMode, Transport, TransportError,
};
pub use endpoint::{spawn_endpoint, EndpointLink, EndpointState, RadioEndpoint};
pub use loopback::{Airspace, LoopbackRadio};
