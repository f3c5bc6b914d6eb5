// Surface rendering: latest-frame slot, renderer lifecycle, GPU backend, render thread.

pub mod gpu;
pub mod slot;
pub mod surface;
pub mod thread;
