//! Admission gate: at most one client per transport.
//!
//! The first accepted connection closes the listening socket. Any later
//! connection attempt is refused by the kernel instead of being accepted and
//! dropped, so a second client never sees protocol bytes. A gate is bound to
//! one transport instance and is never reset; the next activation opens a new
//! transport with a fresh gate.

use crate::error::{Result, TargetError};
use crate::transport::{Connection, SessionTransport, TransportAddress};
use tracing::info;

pub struct AdmissionGate {
    transport: SessionTransport,
}

impl AdmissionGate {
    pub fn new(transport: SessionTransport) -> Self {
        Self { transport }
    }

    pub fn address(&self) -> &TransportAddress {
        self.transport.address()
    }

    /// The listener goes away with the first admission.
    pub fn is_occupied(&self) -> bool {
        !self.transport.is_listening()
    }

    /// Blocks for the first client and admits it.
    pub fn admit(&mut self) -> Result<Connection> {
        if self.is_occupied() {
            return Err(TargetError::GateOccupied(self.address().to_string()));
        }

        let conn = self.transport.accept()?;
        self.transport.stop_listening();
        info!(address = %self.address(), "Debug client admitted");
        Ok(conn)
    }

    /// Tears the transport down; the address disappears with it.
    pub fn close(self) {
        self.transport.close();
    }
}
