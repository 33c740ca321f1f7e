use crate::core::types::{
    Dictionary,
    Value,
};

/// A role the client takes on in its session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PeerRole {
    // Calls RPC endpoints.
    Caller,
    // Registers RPC endpoints.
    Callee,
    // Subscribes to events for topics.
    Subscriber,
}

impl PeerRole {
    pub fn all() -> [PeerRole; 3] {
        [Self::Caller, Self::Callee, Self::Subscriber]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Caller => "caller",
            Self::Callee => "callee",
            Self::Subscriber => "subscriber",
        }
    }

    /// Advanced features announced for the role.
    fn features(&self) -> Dictionary {
        match self {
            Self::Caller => Dictionary::from_iter([
                ("progressive_call_results".to_owned(), Value::Bool(true)),
                ("call_timeout".to_owned(), Value::Bool(true)),
            ]),
            Self::Callee => Dictionary::from_iter([(
                "progressive_call_results".to_owned(),
                Value::Bool(true),
            )]),
            Self::Subscriber => Dictionary::default(),
        }
    }
}

impl TryFrom<&str> for PeerRole {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "caller" => Ok(Self::Caller),
            "callee" => Ok(Self::Callee),
            "subscriber" => Ok(Self::Subscriber),
            _ => Err(Self::Error::msg(format!("invalid peer role: {value}"))),
        }
    }
}

/// The `roles` dictionary announced in HELLO details.
pub fn roles_dictionary<I>(roles: I) -> Dictionary
where
    I: IntoIterator<Item = PeerRole>,
{
    roles
        .into_iter()
        .map(|role| {
            (
                role.name().to_owned(),
                Value::Dictionary(Dictionary::from_iter([(
                    "features".to_owned(),
                    Value::Dictionary(role.features()),
                )])),
            )
        })
        .collect()
}
