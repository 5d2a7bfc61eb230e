use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
};
use rand::rngs::OsRng;

use crate::error::AppError;

#[derive(Clone, Default)]
pub struct Passwords {
    argon: Argon2<'static>,
}

impl Passwords {
    pub fn hash(&self, plain: &str) -> Result<String, AppError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon
            .hash_password(plain.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|err| AppError::Internal(format!("Failed to hash password: {err}")))
    }

    /// Unparsable stored hashes verify as false.
    pub fn verify(&self, plain: &str, stored: &str) -> bool {
        PasswordHash::new(stored)
            .map(|parsed| {
                self.argon
                    .verify_password(plain.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    }
}

#[cfg(test)]
pub(crate) fn fast_passwords() -> Passwords {
    use argon2::{Algorithm, Params, Version};

    let params = Params::new(8, 1, 1, None).unwrap();
    Passwords {
        argon: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
    }
}
