pub mod codec;
pub mod server;

pub use codec::{read_frame, write_frame, FrameReader};
pub use server::{ClientId, ControlServer};
