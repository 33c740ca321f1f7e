/// How a procedure registration or subscription should be matched by the router.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum MatchStyle {
    #[default]
    Exact,
    Prefix,
    Wildcard,
}

impl MatchStyle {
    /// The value of the `match` option, if one must be sent.
    ///
    /// Exact matching is the router default, so it is never sent.
    pub fn option_value(&self) -> Option<&'static str> {
        match self {
            Self::Exact => None,
            Self::Prefix => Some("prefix"),
            Self::Wildcard => Some("wildcard"),
        }
    }
}

impl TryFrom<&str> for MatchStyle {
    type Error = anyhow::Error;
    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "exact" => Ok(Self::Exact),
            "prefix" => Ok(Self::Prefix),
            "wildcard" => Ok(Self::Wildcard),
            _ => Err(Self::Error::msg(format!("invalid match style: {value}"))),
        }
    }
}
