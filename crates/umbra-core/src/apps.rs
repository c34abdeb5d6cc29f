//! # App Launcher Catalogue
//!
//! Apps are stored in two buckets: `important` (shipped/pinned, never
//! removed) and `custom` (user-added or detected). Both buckets are
//! addressed by name.

use crate::routing::is_system_path;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const DEFAULT_GROUP: &str = "Default";
pub const DETECTED_GROUP: &str = "Detected";
pub const ALL_GROUPS: &str = "All groups";

/// Launch profile meaning "keep the current profile".
pub const AUTO_PROFILE: &str = "Auto";

/// Which bucket an entry lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppKind {
    #[default]
    Important,
    Custom,
}

/// One launchable app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppEntry {
    pub name: String,
    pub path: String,
    pub args: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub kind: AppKind,
    pub group: String,
    pub profile: String,
}

impl Default for AppEntry {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: String::new(),
            args: String::new(),
            enabled: true,
            kind: AppKind::Important,
            group: DEFAULT_GROUP.to_string(),
            profile: AUTO_PROFILE.to_string(),
        }
    }
}

impl AppEntry {
    /// A new custom entry.
    #[must_use]
    pub fn custom(name: &str, path: &str, args: &str, group: &str) -> Self {
        Self {
            name: name.trim().to_string(),
            path: path.trim().to_string(),
            args: args.trim().to_string(),
            kind: AppKind::Custom,
            group: group_or_default(group),
            ..Self::default()
        }
    }

    /// Group, with blank mapped to `Default`.
    #[must_use]
    pub fn group(&self) -> &str {
        match self.group.trim() {
            "" => DEFAULT_GROUP,
            g => g,
        }
    }

    /// Profile to switch to before launching, if any.
    #[must_use]
    pub fn launch_profile(&self) -> Option<&str> {
        match self.profile.trim() {
            "" | AUTO_PROFILE => None,
            p => Some(p),
        }
    }

    /// Whether a running process belongs to this app.
    ///
    /// Matches on the executable path or the process name, ignoring case.
    #[must_use]
    pub fn matches_process(&self, proc_name: &str, proc_exe: Option<&str>) -> bool {
        let path = self.path.trim();
        let name = self.name.trim();
        let path_match = !path.is_empty()
            && proc_exe.is_some_and(|exe| exe.trim().eq_ignore_ascii_case(path));
        let name_match = !name.is_empty() && proc_name.trim().eq_ignore_ascii_case(name);
        path_match || name_match
    }

    /// Parsed launch arguments.
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        split_args(&self.args)
    }
}

fn group_or_default(group: &str) -> String {
    match group.trim() {
        "" => DEFAULT_GROUP.to_string(),
        g => g.to_string(),
    }
}

/// Which apps a batch action applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppSelection {
    Names(Vec<String>),
    Enabled,
    Group(String),
}

/// `apps`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppCatalog {
    pub important: Vec<AppEntry>,
    pub custom: Vec<AppEntry>,
    pub last_launch: BTreeMap<String, String>,
    pub last_selected: Vec<String>,
    pub last_group: String,
}

impl Default for AppCatalog {
    fn default() -> Self {
        Self {
            important: Vec::new(),
            custom: Vec::new(),
            last_launch: BTreeMap::new(),
            last_selected: Vec::new(),
            last_group: ALL_GROUPS.to_string(),
        }
    }
}

impl AppCatalog {
    /// Important apps first, then custom.
    pub fn all(&self) -> impl Iterator<Item = &AppEntry> {
        self.important.iter().chain(self.custom.iter())
    }

    fn all_mut(&mut self) -> impl Iterator<Item = &mut AppEntry> {
        self.important.iter_mut().chain(self.custom.iter_mut())
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&AppEntry> {
        self.all().find(|a| a.name == name)
    }

    /// Add a custom app. The name is required.
    pub fn add(&mut self, name: &str, path: &str, args: &str, group: &str) -> Result<&AppEntry> {
        let entry = AppEntry::custom(name, path, args, group);
        if entry.name.is_empty() {
            return Err(CoreError::Empty("app name"));
        }
        self.custom.push(entry);
        let last = self.custom.len() - 1;
        Ok(&self.custom[last])
    }

    /// Add a running process unless it is blank, a system binary or
    /// already known by name. Returns true when added.
    pub fn add_detected(&mut self, name: &str, exe: &str) -> bool {
        let name = name.trim();
        let exe = exe.trim();
        if name.is_empty() || exe.is_empty() || is_system_path(exe) {
            return false;
        }
        if self.custom.iter().any(|a| a.name.eq_ignore_ascii_case(name)) {
            return false;
        }
        self.custom
            .push(AppEntry::custom(name, exe, "", DETECTED_GROUP));
        true
    }

    /// Remove custom apps by name. Important apps are kept.
    pub fn remove(&mut self, names: &[String]) -> usize {
        let before = self.custom.len();
        self.custom.retain(|a| !names.contains(&a.name));
        before - self.custom.len()
    }

    fn update<F>(&mut self, names: &[String], mut f: F) -> usize
    where
        F: FnMut(&mut AppEntry),
    {
        let mut n = 0;
        for app in self.all_mut().filter(|a| names.contains(&a.name)) {
            f(app);
            n += 1;
        }
        n
    }

    /// Move apps to a group. Blank means `Default`.
    pub fn move_to_group(&mut self, names: &[String], group: &str) -> usize {
        let group = group_or_default(group);
        self.update(names, |a| a.group = group.clone())
    }

    pub fn set_profile(&mut self, names: &[String], profile: &str) -> usize {
        let profile = match profile.trim() {
            "" => AUTO_PROFILE.to_string(),
            p => p.to_string(),
        };
        self.update(names, |a| a.profile = profile.clone())
    }

    pub fn set_enabled(&mut self, names: &[String], enabled: bool) -> usize {
        self.update(names, |a| a.enabled = enabled)
    }

    /// Distinct groups, sorted.
    #[must_use]
    pub fn groups(&self) -> Vec<String> {
        self.all()
            .map(|a| a.group().to_string())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Apps matching a selection, in catalogue order.
    #[must_use]
    pub fn select(&self, selection: &AppSelection) -> Vec<&AppEntry> {
        self.all()
            .filter(|a| match selection {
                AppSelection::Names(names) => names.contains(&a.name),
                AppSelection::Enabled => a.enabled,
                AppSelection::Group(g) => a.group() == g,
            })
            .collect()
    }

    pub fn mark_launched(&mut self, name: &str, at: &str) {
        let name = name.trim();
        if !name.is_empty() {
            self.last_launch.insert(name.to_string(), at.to_string());
        }
    }

    /// Remember the selection. Returns true when it changed.
    pub fn remember_selection(&mut self, names: &[String]) -> bool {
        if self.last_selected == names {
            return false;
        }
        self.last_selected = names.to_vec();
        true
    }

    pub fn remember_group(&mut self, group: &str) {
        self.last_group = match group.trim() {
            "" => ALL_GROUPS.to_string(),
            g => g.to_string(),
        };
    }
}

// =============================================================================
// ARGUMENTS
// =============================================================================

/// Split a command-line argument string the way a POSIX shell would.
///
/// Single quotes are literal, double quotes allow `\"` and `\\`, and a
/// backslash outside quotes escapes the next character. Unbalanced quotes
/// fall back to a plain whitespace split.
#[must_use]
pub fn split_args(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    shell_split(raw).unwrap_or_else(|| raw.split_whitespace().map(str::to_string).collect())
}

fn shell_split(raw: &str) -> Option<Vec<String>> {
    #[derive(PartialEq)]
    enum State {
        Blank,
        Word,
        Single,
        Double,
    }

    let mut out = Vec::new();
    let mut word = String::new();
    let mut state = State::Blank;
    let mut chars = raw.chars();

    while let Some(c) = chars.next() {
        match state {
            State::Blank | State::Word => match c {
                c if c.is_whitespace() => {
                    if state == State::Word {
                        out.push(std::mem::take(&mut word));
                    }
                    state = State::Blank;
                }
                '\'' => state = State::Single,
                '"' => state = State::Double,
                '\\' => {
                    word.push(chars.next()?);
                    state = State::Word;
                }
                c => {
                    word.push(c);
                    state = State::Word;
                }
            },
            State::Single => match c {
                '\'' => state = State::Word,
                c => word.push(c),
            },
            State::Double => match c {
                '"' => state = State::Word,
                '\\' => {
                    let next = chars.next()?;
                    if next != '"' && next != '\\' {
                        word.push('\\');
                    }
                    word.push(next);
                }
                c => word.push(c),
            },
        }
    }

    match state {
        State::Single | State::Double => None,
        State::Word => {
            out.push(word);
            Some(out)
        }
        State::Blank => Some(out),
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| (*s).to_string()).collect()
    }

    fn catalog() -> AppCatalog {
        let mut c = AppCatalog::default();
        c.important.push(AppEntry {
            name: "Discord".to_string(),
            path: "C:\\Apps\\Discord.exe".to_string(),
            ..AppEntry::default()
        });
        c.add("OBS", "C:\\obs\\obs64.exe", "--startstreaming", "Stream").unwrap();
        c.add("Steam", "C:\\steam\\steam.exe", "", "").unwrap();
        c
    }

    #[test]
    fn add_requires_name() {
        let mut c = AppCatalog::default();
        assert!(matches!(c.add("  ", "x", "", ""), Err(CoreError::Empty(_))));
        let e = c.add("Game", "g.exe", "", "  ").unwrap();
        assert_eq!(e.group, "Default");
        assert_eq!(e.kind, AppKind::Custom);
        assert_eq!(e.profile, "Auto");
    }

    #[test]
    fn remove_only_touches_custom() {
        let mut c = catalog();
        assert_eq!(c.remove(&names(&["Discord", "Steam"])), 1);
        assert!(c.find("Discord").is_some());
        assert!(c.find("Steam").is_none());
    }

    #[test]
    fn group_profile_enabled_updates() {
        let mut c = catalog();
        assert_eq!(c.move_to_group(&names(&["Discord", "Steam"]), " "), 2);
        assert_eq!(c.groups(), vec!["Default", "Stream"]);
        c.set_profile(&names(&["OBS"]), "Streaming");
        assert_eq!(c.find("OBS").unwrap().launch_profile(), Some("Streaming"));
        assert_eq!(c.find("Steam").unwrap().launch_profile(), None);
        c.set_enabled(&names(&["Steam"]), false);
        let enabled: Vec<_> = c.select(&AppSelection::Enabled).iter().map(|a| a.name.clone()).collect();
        assert_eq!(enabled, vec!["Discord", "OBS"]);
        let grouped = c.select(&AppSelection::Group("Stream".to_string()));
        assert_eq!(grouped.len(), 1);
    }

    #[test]
    fn detected_apps_skip_system_and_known() {
        let mut c = catalog();
        assert!(c.add_detected("chrome.exe", "C:\\Program Files\\Chrome\\chrome.exe"));
        assert!(!c.add_detected("CHROME.EXE", "C:\\other\\chrome.exe"));
        assert!(!c.add_detected("svchost.exe", "C:\\Windows\\System32\\svchost.exe"));
        assert!(!c.add_detected("", "x"));
        assert!(!c.add_detected("kworker", ""));
        assert_eq!(c.find("chrome.exe").unwrap().group, DETECTED_GROUP);
    }

    #[test]
    fn process_matching() {
        let c = catalog();
        let obs = c.find("OBS").unwrap();
        assert!(obs.matches_process("obs64.exe", Some("c:\\OBS\\OBS64.EXE")));
        assert!(obs.matches_process("obs", None));
        assert!(!obs.matches_process("obs64.exe", Some("D:\\obs64.exe")));
    }

    #[test]
    fn selection_memory() {
        let mut c = AppCatalog::default();
        assert!(c.remember_selection(&names(&["A"])));
        assert!(!c.remember_selection(&names(&["A"])));
        c.remember_group("");
        assert_eq!(c.last_group, ALL_GROUPS);
        c.mark_launched("A", "2024-01-01 00:00:00");
        c.mark_launched(" ", "x");
        assert_eq!(c.last_launch.len(), 1);
    }

    #[test]
    fn splits_quoted_args() {
        assert_eq!(split_args(r#"--a "b c" 'd e' f\ g"#), vec!["--a", "b c", "d e", "f g"]);
        assert_eq!(split_args(r#"--path="C:\x y""#), vec![r"--path=C:\x y"]);
        assert_eq!(split_args(""), Vec::<String>::new());
        assert_eq!(split_args("a \"unbalanced b"), vec!["a", "\"unbalanced", "b"]);
        assert_eq!(split_args("''"), vec![""]);
    }

    #[test]
    fn entry_type_field_name() {
        let e = AppEntry::custom("x", "", "", "");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "custom");
    }

    proptest! {
        #[test]
        fn plain_words_split_like_whitespace(words in proptest::collection::vec("[a-zA-Z0-9_.-]{1,8}", 0..6)) {
            let joined = words.join(" ");
            prop_assert_eq!(split_args(&joined), words);
        }
    }
}
