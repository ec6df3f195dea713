use mio::Token;

/// The readiness conditions a selector can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum InterestType {
    Readable,
    Writable,
    Closed,
    Error,
}

/// What became ready for a single registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub token: Token,
    pub readable: bool,
    pub writable: bool,
    pub closed: bool,
    pub error: bool,
    /// The descriptor vanished underneath the registration (it was closed
    /// while still registered); the registration has been dropped.
    pub stale: bool,
}

impl Readiness {
    pub(crate) fn stale(token: Token) -> Self {
        Self {
            token,
            readable: false,
            writable: false,
            closed: true,
            error: true,
            stale: true,
        }
    }

    pub fn has(&self, interest: InterestType) -> bool {
        match interest {
            InterestType::Readable => self.readable,
            InterestType::Writable => self.writable,
            InterestType::Closed => self.closed,
            InterestType::Error => self.error,
        }
    }
}
