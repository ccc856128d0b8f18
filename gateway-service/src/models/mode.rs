use serde::{Deserialize, Serialize};

/// Routing mode requested by the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    General,
    Precise,
    Turbo,
    Manual,
    Ultimate,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::General => "general",
            Mode::Precise => "precise",
            Mode::Turbo => "turbo",
            Mode::Manual => "manual",
            Mode::Ultimate => "ultimate",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "general" => Ok(Mode::General),
            "precise" => Ok(Mode::Precise),
            "turbo" => Ok(Mode::Turbo),
            "manual" => Ok(Mode::Manual),
            "ultimate" => Ok(Mode::Ultimate),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}
