use std::fmt;
use std::str::FromStr;

pub const GROUP_SERVER: &str = "g.us";

/// Parsed form of a `chat_id` target: `user[.agent][:device]@server`.
///
/// A string with no `@` is a bare server address such as `g.us`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChatAddress {
    pub user: String,
    pub agent: u8,
    pub device: u16,
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    Empty,
    TooManyAt,
    EmptyServer,
    TooManyDots,
    InvalidAgent(String),
    InvalidDevice(String),
}

impl fmt::Display for AddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("empty address"),
            Self::TooManyAt => f.write_str("unexpected number of '@' in address"),
            Self::EmptyServer => f.write_str("missing server in address"),
            Self::TooManyDots => f.write_str("unexpected number of dots in address"),
            Self::InvalidAgent(raw) => write!(f, "failed to parse agent `{raw}`"),
            Self::InvalidDevice(raw) => write!(f, "failed to parse device `{raw}`"),
        }
    }
}

impl std::error::Error for AddressError {}

impl ChatAddress {
    pub fn new(user: impl Into<String>, server: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            agent: 0,
            device: 0,
            server: server.into(),
        }
    }

    pub fn is_group(&self) -> bool {
        self.server == GROUP_SERVER
    }
}

impl FromStr for ChatAddress {
    type Err = AddressError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AddressError::Empty);
        }

        let mut parts = raw.split('@');
        let (user_part, server) = match (parts.next(), parts.next(), parts.next()) {
            (Some(server), None, None) => return Ok(Self::new("", server)),
            (Some(user), Some(server), None) => (user, server),
            _ => return Err(AddressError::TooManyAt),
        };
        if server.is_empty() {
            return Err(AddressError::EmptyServer);
        }

        let (user_agent, device) = match user_part.split_once(':') {
            Some((ua, device)) => {
                let device = device
                    .parse::<u16>()
                    .map_err(|_| AddressError::InvalidDevice(device.to_string()))?;
                (ua, device)
            }
            None => (user_part, 0),
        };

        let dots = user_agent.matches('.').count();
        let (user, agent) = match dots {
            0 => (user_agent, 0),
            1 => {
                let (user, agent) = user_agent.split_once('.').unwrap_or((user_agent, "0"));
                let agent = agent
                    .parse::<u8>()
                    .map_err(|_| AddressError::InvalidAgent(agent.to_string()))?;
                (user, agent)
            }
            _ => return Err(AddressError::TooManyDots),
        };

        Ok(Self {
            user: user.to_string(),
            agent,
            device,
            server: server.to_string(),
        })
    }
}

impl fmt::Display for ChatAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user.is_empty() {
            return f.write_str(&self.server);
        }
        f.write_str(&self.user)?;
        if self.agent > 0 {
            write!(f, ".{}", self.agent)?;
        }
        if self.device > 0 {
            write!(f, ":{}", self.device)?;
        }
        write!(f, "@{}", self.server)
    }
}
