use crate::core::uri::Uri;

/// A reason sent in GOODBYE.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The client is leaving the realm on its own.
    #[default]
    Normal,
    /// Reply to a GOODBYE sent by the router.
    GoodbyeAndOut,
}

impl CloseReason {
    pub fn uri(&self) -> Uri {
        Uri::from_known(match self {
            Self::Normal => "wamp.close.normal",
            Self::GoodbyeAndOut => "wamp.close.goodbye_and_out",
        })
    }
}
