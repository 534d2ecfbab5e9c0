//! Session identity for the calling process.
//!
//! Terminal emulators export a per-tab session id; when none is present the
//! parent process id stands in, which is stable for the life of the shell
//! that launched us.

use chorus_types::SessionId;

/// Environment variables consulted in order.
pub const SESSION_ENV_VARS: [&str; 3] = ["CHORUS_SESSION_ID", "ITERM_SESSION_ID", "TERM_SESSION_ID"];

/// Derives the session id from the real environment.
pub fn session_from_env() -> SessionId {
    derive_session_id(|key| std::env::var(key).ok(), parent_pid())
}

/// Derives a session id from `lookup` with `parent_pid` as fallback.
///
/// Characters that are unsafe in file names (`:` and `-` included, as
/// terminal ids use them as separators) are replaced with `_`.
pub fn derive_session_id(lookup: impl Fn(&str) -> Option<String>, parent_pid: u32) -> SessionId {
    SESSION_ENV_VARS
        .iter()
        .filter_map(|key| lookup(key))
        .map(|raw| sanitize(raw.trim()))
        .find(|id| !id.is_empty())
        .map(SessionId::new)
        .unwrap_or_else(|| SessionId::new(format!("ppid_{parent_pid}")))
}

fn sanitize(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '.' { c } else { '_' })
        .collect::<String>()
        .trim_matches('.')
        .to_string()
}

#[cfg(unix)]
fn parent_pid() -> u32 {
    std::os::unix::process::parent_id()
}

#[cfg(not(unix))]
fn parent_pid() -> u32 {
    std::process::id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn iterm_session_is_sanitized() {
        let id = derive_session_id(env(&[("ITERM_SESSION_ID", "w0t1p0:ABCD-12")]), 42);
        assert_eq!(id.as_str(), "w0t1p0_ABCD_12");
    }

    #[test]
    fn explicit_override_wins() {
        let id = derive_session_id(
            env(&[("CHORUS_SESSION_ID", "pinned"), ("TERM_SESSION_ID", "other")]),
            42,
        );
        assert_eq!(id.as_str(), "pinned");
    }

    #[test]
    fn blank_values_fall_through_to_parent_pid() {
        let id = derive_session_id(env(&[("TERM_SESSION_ID", "   ")]), 4242);
        assert_eq!(id.as_str(), "ppid_4242");
    }

    #[test]
    fn path_separators_never_survive() {
        let id = derive_session_id(env(&[("TERM_SESSION_ID", "../../etc/passwd")]), 1);
        assert!(!id.as_str().contains('/'));
        assert!(!id.as_str().starts_with('.'));
    }
}
