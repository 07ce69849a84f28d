//! Client side of hotattach.
//!
//! Given a pid, [`Attacher`] checks that the process is alive, activates an
//! armed target with its signal when its debug socket does not exist yet,
//! waits for the socket with bounded polling and relays the session between
//! the operator and the target.

pub mod attach;
pub mod config;
pub mod error;
pub mod probe;
pub mod relay;

pub use attach::{attach_tcp, Attacher};
pub use config::AttachConfig;
pub use error::{AttachError, Result};
pub use probe::{ProcessControl, SystemProcess};
pub use relay::{RelayOutcome, RelayReport};
