//! The voice datapath: wire format, bandwidth policing, the UDP receive
//! thread, the router, and the dual-path transmitter.

pub mod bandwidth;
pub mod proto;
pub mod receiver;
pub mod router;
pub mod transmit;

pub use receiver::UdpReceiver;
pub use router::VoiceRouter;
pub use transmit::Transmitter;
