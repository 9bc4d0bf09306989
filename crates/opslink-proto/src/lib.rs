//! Wire protocol shared between the sync layer and the operations backend.
//! Keeping this in a dedicated crate allows regeneration of bindings for
//! other clients without pulling in the runtime code.

mod envelope;
mod event;
mod model;

pub use envelope::{Envelope, ProtoError};
pub use event::{ClientMessage, ServerEvent};
pub use model::{
    Alert, AssetStatus, Identity, Metrics, Severity, TransitRecord, TransitStatus,
};
