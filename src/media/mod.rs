//! Media stack behind the session's collaborator traits: synthetic
//! capture, pass-through encoding and the encrypted RTP/UDP transport.

pub mod crypto;
pub mod rtp;
pub mod synthetic;
pub mod udp;

pub use synthetic::{RawEncoderFactory, SyntheticCapture};
pub use udp::UdpTransportProvider;
