//! Control signals delivered to a running record stage.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
    Refresh,
}

impl ControlSignal {
    /// Wire code pushed onto the control list.
    pub fn code(&self) -> u8 {
        match self {
            Self::Pause => 1,
            Self::Resume => 2,
            Self::Stop => 3,
            Self::Refresh => 4,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Pause),
            2 => Some(Self::Resume),
            3 => Some(Self::Stop),
            4 => Some(Self::Refresh),
            _ => None,
        }
    }

    /// Decode a raw list payload.
    pub fn decode(raw: &str) -> Option<Self> {
        raw.trim().parse::<u8>().ok().and_then(Self::from_code)
    }

    pub fn encode(&self) -> String {
        self.code().to_string()
    }
}

impl std::fmt::Display for ControlSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Stop => "stop",
            Self::Refresh => "refresh",
        };
        f.write_str(name)
    }
}
