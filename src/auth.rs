//! Password hashing and verification.
//!
//! Argon2id for stored account passwords; hashing runs on the blocking
//! pool so the runtime threads stay responsive.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};

/// Verify a password against a stored hash.
#[must_use = "password verification result must be checked"]
pub async fn verify_password(password: String, hash: String) -> bool {
    tokio::task::spawn_blocking(move || {
        let Ok(parsed) = PasswordHash::new(&hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    })
    .await
    .unwrap_or(false)
}

/// Hash a password with default Argon2 settings.
pub async fn hash_password(password: String) -> Result<String, argon2::password_hash::Error> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Ok(Argon2::default()
            .hash_password(password.as_bytes(), &salt)?
            .to_string())
    })
    .await
    .expect("spawn_blocking failed")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_then_verify() {
        let hash = hash_password("hunter2".into()).await.unwrap();
        assert!(verify_password("hunter2".into(), hash.clone()).await);
        assert!(!verify_password("wrong".into(), hash).await);
    }

    #[tokio::test]
    async fn garbage_hash_never_verifies() {
        assert!(!verify_password("x".into(), "not-a-hash".into()).await);
    }
}
