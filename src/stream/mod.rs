// Remote streaming: JPEG encoding, wire format, publisher server, and viewer client.

pub mod compress;
pub mod error;
pub mod server;
pub mod viewer;
pub mod wire;
