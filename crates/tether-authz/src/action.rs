use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    AccountRead,
    ProjectRead,
    LogsRead,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::AccountRead => "account.read",
            Action::ProjectRead => "project.read",
            Action::LogsRead => "logs.read",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = ();

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "account.read" => Ok(Action::AccountRead),
            "project.read" => Ok(Action::ProjectRead),
            "logs.read" => Ok(Action::LogsRead),
            _ => Err(()),
        }
    }
}
