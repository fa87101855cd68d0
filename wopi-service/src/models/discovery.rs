use serde::{Deserialize, Serialize};
use std::fmt;

/// Editor application published by the document host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppName {
    Calc,
    Writer,
    Impress,
    Draw,
}

impl AppName {
    pub const ALL: [AppName; 4] = [AppName::Calc, AppName::Writer, AppName::Impress, AppName::Draw];

    pub fn as_str(self) -> &'static str {
        match self {
            AppName::Calc => "calc",
            AppName::Writer => "writer",
            AppName::Impress => "impress",
            AppName::Draw => "draw",
        }
    }

    /// Match a discovery `<app name=..>` attribute.
    pub fn from_discovery_name(name: &str) -> Option<Self> {
        AppName::ALL
            .into_iter()
            .find(|app| app.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for AppName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    View,
    #[default]
    Edit,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::View => "view",
            Action::Edit => "edit",
        }
    }
}

/// Where to open a given app, as published by the host's discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveryDescriptor {
    pub app_name: AppName,
    pub edit_action_url: String,
    pub view_action_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discovery_app_names_match_case_insensitively() {
        assert_eq!(AppName::from_discovery_name("Calc"), Some(AppName::Calc));
        assert_eq!(AppName::from_discovery_name("writer"), Some(AppName::Writer));
        assert_eq!(
            AppName::from_discovery_name("application/vnd.ms-excel"),
            None
        );
    }

    #[test]
    fn action_defaults_to_edit() {
        assert_eq!(Action::default(), Action::Edit);
        assert_eq!(serde_json::to_string(&Action::View).unwrap(), "\"view\"");
    }
}
