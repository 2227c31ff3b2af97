//! Credentials and round-robin rotation across them
//!
//! The rotation cursor only lives in memory: after a restart rotation begins
//! again at the first configured credential.

use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::HashSet;
use tracing::{info, warn};

/// A named identity used to authenticate with the provisioning service
#[derive(Clone, Deserialize, PartialEq, Eq)]
pub struct Credential {
    /// Display name, also used as the credential identifier on instances
    pub name: String,
    /// Login name, if the provisioner needs one separate from the secret
    #[serde(default)]
    pub username: Option<String>,
    /// Opaque secret material
    #[serde(default)]
    pub secret: String,
}

impl Credential {
    pub fn new(name: &str, secret: &str) -> Self {
        Self {
            name: name.to_string(),
            username: None,
            secret: secret.to_string(),
        }
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Pick the credential following `cursor` in list order.
///
/// Starts at the first credential when nothing was selected yet, and wraps
/// to the first when the cursor names the last entry or a credential that is
/// no longer configured.
pub fn next_after<'a>(credentials: &'a [Credential], cursor: Option<&str>) -> Option<&'a Credential> {
    let first = credentials.first()?;
    let Some(last_used) = cursor else {
        return Some(first);
    };

    match credentials.iter().position(|c| c.name == last_used) {
        Some(i) if i + 1 < credentials.len() => Some(&credentials[i + 1]),
        _ => Some(first),
    }
}

/// Round-robin rotation over the configured credentials
pub struct CredentialRotator {
    credentials: Vec<Credential>,
    /// Name of the most recently selected credential
    cursor: Mutex<Option<String>>,
}

impl CredentialRotator {
    pub fn new(credentials: Vec<Credential>) -> Self {
        Self {
            credentials,
            cursor: Mutex::new(None),
        }
    }

    pub fn credentials(&self) -> &[Credential] {
        &self.credentials
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Name of the credential selected last, if any
    pub fn last_selected(&self) -> Option<String> {
        self.cursor.lock().clone()
    }

    /// Select the next credential in rotation and advance the cursor.
    /// Returns `None` only when no credentials are configured.
    pub fn select_next(&self) -> Option<Credential> {
        self.select_next_excluding(&HashSet::new())
    }

    /// Like [`select_next`](Self::select_next), but skips credentials whose
    /// names are in `excluded`. Returns `None` once every credential is excluded.
    pub fn select_next_excluding(&self, excluded: &HashSet<String>) -> Option<Credential> {
        if self.credentials.is_empty() {
            warn!("No credentials configured, manual provisioning will be required");
            return None;
        }

        let mut cursor = self.cursor.lock();
        let mut position = cursor.clone();
        for _ in 0..self.credentials.len() {
            let candidate = next_after(&self.credentials, position.as_deref())?;
            if !excluded.contains(&candidate.name) {
                if cursor.is_none() {
                    info!(credential = %candidate.name, "Selected initial credential");
                } else {
                    info!(credential = %candidate.name, "Rotating to next credential");
                }
                *cursor = Some(candidate.name.clone());
                return Some(candidate.clone());
            }
            position = Some(candidate.name.clone());
        }

        None
    }

    /// Select a credential by name, moving the cursor to it
    pub fn select_named(&self, name: &str) -> Option<Credential> {
        let credential = self.credentials.iter().find(|c| c.name == name)?;
        *self.cursor.lock() = Some(credential.name.clone());
        info!(credential = %credential.name, "Selected requested credential");
        Some(credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(names: &[&str]) -> Vec<Credential> {
        names.iter().map(|n| Credential::new(n, "secret")).collect()
    }

    fn names(selected: Vec<Option<Credential>>) -> Vec<String> {
        selected.into_iter().map(|c| c.unwrap().name).collect()
    }

    #[test]
    fn test_empty_list_selects_nothing() {
        let rotator = CredentialRotator::new(Vec::new());
        assert!(rotator.select_next().is_none());
        assert!(rotator.last_selected().is_none());
    }

    #[test]
    fn test_first_selection_is_first_credential() {
        let rotator = CredentialRotator::new(creds(&["a", "b", "c"]));
        assert_eq!(rotator.select_next().unwrap().name, "a");
        assert_eq!(rotator.last_selected().as_deref(), Some("a"));
    }

    #[test]
    fn test_round_robin_period_matches_list_length() {
        let list = creds(&["a", "b", "c", "d"]);
        for start in [None, Some("a"), Some("b"), Some("c"), Some("d"), Some("gone")] {
            let mut cursor = start.map(str::to_string);
            let mut seen = Vec::new();
            for _ in 0..list.len() {
                let next = next_after(&list, cursor.as_deref()).unwrap();
                seen.push(next.name.clone());
                cursor = Some(next.name.clone());
            }
            let unique: HashSet<_> = seen.iter().collect();
            assert_eq!(unique.len(), list.len(), "start {:?} gave {:?}", start, seen);

            // The next call starts the cycle over
            let again = next_after(&list, cursor.as_deref()).unwrap();
            assert_eq!(again.name, seen[0]);
        }
    }

    #[test]
    fn test_wraps_after_last_credential() {
        let rotator = CredentialRotator::new(creds(&["a", "b"]));
        let picks = names(vec![
            rotator.select_next(),
            rotator.select_next(),
            rotator.select_next(),
        ]);
        assert_eq!(picks, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_unknown_cursor_wraps_to_first() {
        let list = creds(&["a", "b"]);
        assert_eq!(next_after(&list, Some("removed")).unwrap().name, "a");
    }

    #[test]
    fn test_select_excluding_skips_visited() {
        let rotator = CredentialRotator::new(creds(&["a", "b", "c"]));
        let mut visited = HashSet::new();

        let first = rotator.select_next_excluding(&visited).unwrap();
        assert_eq!(first.name, "a");
        visited.insert(first.name);

        let second = rotator.select_next_excluding(&visited).unwrap();
        assert_eq!(second.name, "b");
        visited.insert(second.name);

        let third = rotator.select_next_excluding(&visited).unwrap();
        assert_eq!(third.name, "c");
        visited.insert(third.name);

        assert!(rotator.select_next_excluding(&visited).is_none());
        assert_eq!(rotator.last_selected().as_deref(), Some("c"));
    }

    #[test]
    fn test_select_excluding_wraps_past_excluded() {
        let rotator = CredentialRotator::new(creds(&["a", "b", "c"]));
        rotator.select_named("b").unwrap();

        let mut visited = HashSet::new();
        visited.insert("c".to_string());
        assert_eq!(rotator.select_next_excluding(&visited).unwrap().name, "a");
    }

    #[test]
    fn test_select_named_moves_cursor() {
        let rotator = CredentialRotator::new(creds(&["a", "b", "c"]));
        assert_eq!(rotator.select_named("b").unwrap().name, "b");
        assert_eq!(rotator.select_next().unwrap().name, "c");
        assert!(rotator.select_named("missing").is_none());
        assert_eq!(rotator.last_selected().as_deref(), Some("c"));
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credential = Credential::new("primary", "hunter2");
        let debug = format!("{:?}", credential);
        assert!(debug.contains("primary"));
        assert!(!debug.contains("hunter2"));
    }
}
