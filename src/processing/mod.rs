// Processing stage: buffer conversion, mode register, and the processing bridge.

pub mod bridge;
pub mod convert;
pub mod frame;
pub mod mode;
