//! Owner authentication.
//!
//! One owner account with an argon2-hashed password. Sessions are in-memory
//! sets of full prefixes (`nick!user@host`) and last until restart. Stored
//! hostmasks auto-open a session when a matching prefix speaks.

use std::collections::HashSet;

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use tokio::sync::RwLock;

use crate::db::Db;
use crate::error::{AuthError, DbError};

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Hash(e.to_string()))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    match PasswordHash::new(stored) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Authenticated prefixes for this process lifetime.
#[derive(Default)]
pub struct Sessions {
    prefixes: RwLock<HashSet<String>>,
}

impl Sessions {
    pub async fn login(&self, prefix: &str) {
        self.prefixes.write().await.insert(prefix.to_string());
        tracing::info!("Session opened for {prefix}");
    }

    pub async fn logout(&self, prefix: &str) {
        if self.prefixes.write().await.remove(prefix) {
            tracing::info!("Session closed for {prefix}");
        }
    }

    pub async fn contains(&self, prefix: &str) -> bool {
        self.prefixes.read().await.contains(prefix)
    }
}

/// True when the prefix has an open session or matches a stored hostmask.
/// A hostmask match opens a session so later checks skip the scan.
pub async fn is_authenticated(
    db: &Db,
    sessions: &Sessions,
    prefix: &str,
) -> Result<bool, DbError> {
    if sessions.contains(prefix).await {
        return Ok(true);
    }
    for mask in db.hostmask_list().await? {
        if mask_matches(prefix, &mask) {
            sessions.login(prefix).await;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Case-insensitive glob match; `*` and `?` are wildcards.
pub fn mask_matches(prefix: &str, mask: &str) -> bool {
    let mut pattern = String::with_capacity(mask.len() + 8);
    pattern.push('^');
    for c in mask.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            c => pattern.push_str(&regex::escape(&c.to_string())),
        }
    }
    pattern.push('$');
    match regex::Regex::new(&pattern.to_lowercase()) {
        Ok(re) => re.is_match(&prefix.to_lowercase()),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_roundtrip() {
        let hash = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &hash));
        assert!(!verify_password("hunter3", &hash));
    }

    #[test]
    fn malformed_hash_never_verifies() {
        assert!(!verify_password("hunter2", "not-a-hash"));
        assert!(!verify_password("hunter2", ""));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("hunter2").unwrap();
        let b = hash_password("hunter2").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn mask_globs() {
        assert!(mask_matches("alice!ali@home.example", "alice!*@home.example"));
        assert!(mask_matches("Alice!ali@Home.Example", "alice!*@home.example"));
        assert!(mask_matches("alice!ali@home.example", "*!*@home.example"));
        assert!(mask_matches("alice!ali@h1.example", "alice!*@h?.example"));
        assert!(!mask_matches("bob!ali@home.example", "alice!*@home.example"));
        // Regex metacharacters in masks stay literal.
        assert!(!mask_matches("aliceXali@home", "alice.ali@home"));
    }

    #[tokio::test]
    async fn hostmask_match_opens_session() {
        let db = Db::connect_in_memory().await.unwrap();
        let sessions = Sessions::default();
        let prefix = "alice!ali@home.example";

        assert!(!is_authenticated(&db, &sessions, prefix).await.unwrap());

        db.hostmask_add("alice!*@home.example").await.unwrap();
        assert!(is_authenticated(&db, &sessions, prefix).await.unwrap());
        assert!(sessions.contains(prefix).await, "auto-login persists");

        sessions.logout(prefix).await;
        // Mask still matches, so the session reopens.
        assert!(is_authenticated(&db, &sessions, prefix).await.unwrap());
    }
}
