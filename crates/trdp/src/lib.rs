//! TRDP session engine (IEC 61375-2-3): cyclic process data over UDP and
//! session-oriented message data over UDP/TCP, driven from the host's event
//! loop.
//!
//! The host owns the loop; the engine makes progress only inside
//! [`Session::process`]:
//!
//! ```no_run
//! use trdp::{Session, SessionConfig, Event};
//!
//! let mut session = Session::open(SessionConfig::default())?;
//! loop {
//!     session.wait(trdp::Micros::from_millis(500))?;
//!     session.process(|event| match event {
//!         Event::PdReceived { meta, payload, .. } => {
//!             println!("com-id {} -> {} bytes", meta.com_id, payload.len());
//!         }
//!         _ => {}
//!     })?;
//! }
//! # #[allow(unreachable_code)]
//! # Ok::<(), trdp::Error>(())
//! ```

mod config;
mod error;
mod event;
mod handle;
mod marshall;
mod md;
mod pd;
mod session;
mod stats;

pub use config::{MdConfig, PdConfig, SendParam, SessionConfig, TimeoutBehavior};
pub use error::{Error, Result};
pub use event::{Event, MdInfo, MdResult, RxMeta};
pub use handle::{ListenerId, PubId, SubId};
pub use marshall::Marshaller;
pub use md::{ListenerSpec, MD_MAX_UDP_PAYLOAD, MdSendSpec, RequestOpts, Transport, TransportMask};
pub use pd::{PdSample, PreSendHook, PublishSpec, PullSpec, SubscribeSpec};
pub use session::Session;
// Re-exported so hosts need only this crate for the common surface.
pub use trdp_mem::{BlockPool, MemStats, NUM_CLASSES};
pub use trdp_timing::Micros;
pub use trdp_wire::{MD_PORT, PD_MAX_PAYLOAD, PD_UDP_PORT, SessionUuid, Uri};
