//! Per-tab identity within one workspace.

use serde::Serialize;
use uuid::Uuid;

/// Identity of one tab viewing one workspace. The display name lives on the
/// coordinator because it changes; this holds the immutable part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Session {
    pub workspace_id: String,
    pub session_id: String,
}

/// Generate a fresh session id.
pub fn generate_session_id() -> String {
    Uuid::new_v4().to_string()
}

/// Default display name: `User-` followed by four random hex characters.
pub fn generate_display_name() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("User-{}", &suffix[..4])
}

/// Generate an id for a tab that connected without one.
pub fn generate_tab_id() -> String {
    Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_shape() {
        let name = generate_display_name();
        assert!(name.starts_with("User-"));
        assert_eq!(name.len(), 9);
        assert!(name[5..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn tab_ids_are_plain_uuids() {
        let a = generate_tab_id();
        let b = generate_tab_id();
        assert!(Uuid::parse_str(&a).is_ok(), "got {a:?}");
        assert_ne!(a, b);
    }

    #[test]
    fn session_ids_are_unique() {
        assert_ne!(generate_session_id(), generate_session_id());
    }
}
