// Camera domain: devices, frame queue, and the capture session controller.

pub mod backend;
pub mod dummy;
pub mod error;
pub mod queue;
pub mod session;
pub mod types;
