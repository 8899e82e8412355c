//! Firewall policy truth tables
//!
//! | mode      | when   | backend allows | before connect | after connect |
//! |-----------|--------|----------------|----------------|---------------|
//! | Manual    | any    | any            | -              | -             |
//! | AlwaysOn  | any    | any            | -              | -             |
//! | Automatic | Before | yes            | enable         | -             |
//! | Automatic | Before | no             | enable         | disable       |
//! | Automatic | After  | yes            | -              | enable        |
//! | Automatic | After  | no             | -              | -             |
//!
//! Per connection at most one enable fires.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallMode {
    #[default]
    Manual,
    Automatic,
    AlwaysOn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirewallWhen {
    #[default]
    BeforeConnection,
    AfterConnection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirewallSettings {
    pub mode: FirewallMode,
    pub when: FirewallWhen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterConnectAction {
    Keep,
    Enable,
    Disable,
}

/// Turn the firewall on as part of the connect command
pub fn enable_before_connection(settings: FirewallSettings) -> bool {
    settings.mode == FirewallMode::Automatic && settings.when == FirewallWhen::BeforeConnection
}

/// What to do once the tunnel reports Connected
///
/// `backend_allows` is the backend's opt-out for post-connect firewalling
/// (some custom configs route in ways the firewall would break).
pub fn after_connection(settings: FirewallSettings, backend_allows: bool) -> AfterConnectAction {
    if settings.mode != FirewallMode::Automatic {
        return AfterConnectAction::Keep;
    }
    match (settings.when, backend_allows) {
        (FirewallWhen::AfterConnection, true) => AfterConnectAction::Enable,
        (FirewallWhen::BeforeConnection, false) => AfterConnectAction::Disable,
        _ => AfterConnectAction::Keep,
    }
}

/// Turn the firewall off when the user disconnects
pub fn disable_on_user_disconnect(settings: FirewallSettings) -> bool {
    settings.mode == FirewallMode::Automatic
}

/// Firewall state left behind when the process exits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    /// Keep the rules and restore them at boot
    OnBoot,
    /// Remove the rules and the boot hook
    Off,
}

pub fn on_exit(
    firewall_checked: bool,
    exit_with_restart: bool,
    launch_on_start: bool,
    always_on: bool,
) -> ExitAction {
    if !firewall_checked {
        return ExitAction::Off;
    }
    if always_on || (exit_with_restart && launch_on_start) {
        ExitAction::OnBoot
    } else {
        ExitAction::Off
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(mode: FirewallMode, when: FirewallWhen) -> FirewallSettings {
        FirewallSettings { mode, when }
    }

    #[test]
    fn test_automatic_combinations_enable_at_most_once() {
        for when in [FirewallWhen::BeforeConnection, FirewallWhen::AfterConnection] {
            for backend_allows in [true, false] {
                let s = settings(FirewallMode::Automatic, when);
                let enables = enable_before_connection(s) as u8
                    + (after_connection(s, backend_allows) == AfterConnectAction::Enable) as u8;
                assert!(enables <= 1, "{:?} allows={}", when, backend_allows);
            }
        }
    }

    #[test]
    fn test_truth_table() {
        use AfterConnectAction::*;
        use FirewallMode::*;
        use FirewallWhen::*;

        let cases = [
            (Automatic, BeforeConnection, true, true, Keep),
            (Automatic, BeforeConnection, false, true, Disable),
            (Automatic, AfterConnection, true, false, Enable),
            (Automatic, AfterConnection, false, false, Keep),
            (Manual, BeforeConnection, true, false, Keep),
            (Manual, AfterConnection, true, false, Keep),
            (AlwaysOn, BeforeConnection, false, false, Keep),
            (AlwaysOn, AfterConnection, true, false, Keep),
        ];
        for (mode, when, allows, before, after) in cases {
            let s = settings(mode, when);
            assert_eq!(enable_before_connection(s), before, "{:?}/{:?}", mode, when);
            assert_eq!(after_connection(s, allows), after, "{:?}/{:?}/{}", mode, when, allows);
        }
    }

    #[test]
    fn test_disable_on_user_disconnect_only_automatic() {
        assert!(disable_on_user_disconnect(settings(
            FirewallMode::Automatic,
            FirewallWhen::AfterConnection
        )));
        assert!(!disable_on_user_disconnect(settings(
            FirewallMode::AlwaysOn,
            FirewallWhen::BeforeConnection
        )));
    }

    #[test]
    fn test_exit_table() {
        // (checked, restart, launch_on_start, always_on)
        assert_eq!(on_exit(false, true, true, true), ExitAction::Off);
        assert_eq!(on_exit(true, true, true, false), ExitAction::OnBoot);
        assert_eq!(on_exit(true, true, false, true), ExitAction::OnBoot);
        assert_eq!(on_exit(true, true, false, false), ExitAction::Off);
        assert_eq!(on_exit(true, false, true, false), ExitAction::Off);
        assert_eq!(on_exit(true, false, false, true), ExitAction::OnBoot);
    }
}
