mod forwarder;
mod pump;

pub(crate) use forwarder::{spawn_forwarder, FrameQueue};
pub(crate) use pump::EventPump;
