//! Call module
//!
//! Call lifecycle, offer/answer orchestration and the endpoint task that
//! serialises every event touching them.

mod endpoint;
mod lifecycle;
mod negotiator;

pub use endpoint::{CallEvent, Endpoint, EndpointHandle, EndpointStatus, SignalingConnector};
pub use lifecycle::{CallManager, CallSession};
pub use negotiator::{Disposition, Negotiator};
