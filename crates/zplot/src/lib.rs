//! Live photon-count display.
//!
//! Photon packets arrive over UDP from the TDC, are decoded into
//! [`PhotonEvent`](photon_wire::PhotonEvent)s, pass through a bounded
//! [`TransportQueue`](queue::TransportQueue) and are accumulated into an
//! image that is blitted straight into a memory-mapped framebuffer. A rotary
//! encoder sets the display gain; push-buttons clear the image and capture
//! screenshots.
//!
//! Three execution contexts share work:
//!
//! - **ingestion**: a dedicated thread with a current-thread runtime owning
//!   the UDP socket and the packet decoder ([`ingest`]);
//! - **rendering**: the main runtime, running the accumulate and blit duties
//!   of the [`framebuffer::Renderer`];
//! - **controls**: a GPIO thread feeding the encoder and button decoders
//!   ([`controls`]).
//!
//! They are stopped together through a [`shutdown::Shutdown`] handle.

pub mod config;
pub mod controls;
pub mod framebuffer;
pub mod gain;
pub mod ingest;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod shutdown;

pub use photon_wire::PhotonEvent;
