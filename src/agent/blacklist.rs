use std::collections::HashSet;

use super::bridge::ForegroundApp;

/// Executables the agent never clicks in or learns from unless configured
/// otherwise.
pub const DEFAULT_FORBIDDEN_APPS: &[&str] = &[
    "explorer.exe",
    "cmd.exe",
    "powershell.exe",
    "code.exe",
    "devenv.exe",
    "pycharm64.exe",
    "steam.exe",
    "notepad++.exe",
    "spotify.exe",
    "update.exe",
    "discord.exe",
];

pub struct AppBlacklist {
    apps: HashSet<String>,
}

impl AppBlacklist {
    pub fn new<I, S>(apps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            apps: apps
                .into_iter()
                .map(|app| app.as_ref().trim().to_lowercase())
                .filter(|app| !app.is_empty())
                .collect(),
        }
    }

    pub fn is_blocked(&self, app: &str) -> bool {
        self.apps.contains(&app.trim().to_lowercase())
    }

    /// Name of the focused app when it is blacklisted.
    pub fn check(&self, foreground: &dyn ForegroundApp) -> Option<String> {
        foreground
            .foreground_app_name()
            .filter(|app| self.is_blocked(app))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Focused(Option<&'static str>);

    impl ForegroundApp for Focused {
        fn foreground_app_name(&self) -> Option<String> {
            self.0.map(str::to_string)
        }
    }

    #[test]
    fn matches_case_insensitively() {
        let blacklist = AppBlacklist::new(DEFAULT_FORBIDDEN_APPS);
        assert_eq!(
            blacklist.check(&Focused(Some("Code.EXE"))),
            Some("Code.EXE".to_string())
        );
        assert!(blacklist.check(&Focused(Some("game.exe"))).is_none());
        assert!(blacklist.check(&Focused(None)).is_none());
    }

    #[test]
    fn empty_entries_are_ignored() {
        let blacklist = AppBlacklist::new(["", "  "]);
        assert!(!blacklist.is_blocked(""));
    }
}
