//! Password and one-time code primitives.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use lazy_static::lazy_static;
use rand::{distr::Alphanumeric, seq::SliceRandom, Rng};
use regex::Regex;

use crate::error::ValidationError;

const SPECIAL_CHARACTERS: &[u8] = b"!@#$%^&*()_+={};':\"|\\,.<>/?~-";

lazy_static! {
    /// One `@` with something on either side, no whitespace
    static ref EMAIL_REGEX: Regex = Regex::new(r"^[^@\s]+@[^@\s]+$").unwrap();

    /// Compared against when the email is unknown so both failure paths cost one verification
    static ref DUMMY_HASH: String = hash_password("voicegate-dummy-password").unwrap_or_default();
}

/// Hash a password or code using Argon2
pub fn hash_password(password: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2.hash_password(password.as_bytes(), &salt)?;
    Ok(hash.to_string())
}

/// Verify a password or code against a stored hash
pub fn verify_password(password: &str, hash: &str) -> bool {
    let parsed_hash = match PasswordHash::new(hash) {
        Ok(h) => h,
        Err(_) => return false,
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok()
}

/// Burn one verification without a real hash.
pub fn verify_dummy(password: &str) {
    let _ = verify_password(password, &DUMMY_HASH);
}

/// Trimmed, lower-cased address, or the reason it is unusable.
pub fn normalize_email(email: &str) -> Result<String, ValidationError> {
    let email = email.trim().to_lowercase();
    if email.len() < 3 || email.len() > 254 {
        return Err(ValidationError::field(
            "email",
            "Email must be between 3 and 254 characters",
        ));
    }
    if !EMAIL_REGEX.is_match(&email) {
        return Err(ValidationError::field("email", "Email must contain an @"));
    }
    Ok(email)
}

/// 8 to 30 characters with upper, lower, digit and special.
pub fn validate_password_strength(field: &str, password: &str) -> Result<(), ValidationError> {
    let length = password.chars().count();
    if !(8..=30).contains(&length) {
        return Err(ValidationError::field(
            field,
            "Password must be between 8 and 30 characters",
        ));
    }

    let has_uppercase = password.chars().any(|c| c.is_uppercase());
    let has_lowercase = password.chars().any(|c| c.is_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_special = password.chars().any(|c| !c.is_alphanumeric());

    let problem = if !has_uppercase {
        Some("Password must contain at least one uppercase letter")
    } else if !has_lowercase {
        Some("Password must contain at least one lowercase letter")
    } else if !has_digit {
        Some("Password must contain at least one digit")
    } else if !has_special {
        Some("Password must contain at least one special character")
    } else {
        None
    };

    match problem {
        Some(message) => Err(ValidationError::field(field, message)),
        None => Ok(()),
    }
}

/// Six alphanumeric characters for email verification.
pub fn verification_code() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect()
}

/// Six digits for password resets.
pub fn reset_code() -> String {
    let mut rng = rand::rng();
    (0..6)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Random password that satisfies [`validate_password_strength`].
pub fn temporary_password() -> String {
    let mut rng = rand::rng();
    let mut chars: Vec<char> = Vec::with_capacity(12);
    for _ in 0..4 {
        chars.push(char::from(b'a' + rng.random_range(0..26u8)));
        chars.push(char::from(b'A' + rng.random_range(0..26u8)));
    }
    for _ in 0..2 {
        chars.push(char::from(b'0' + rng.random_range(0..10u8)));
        let special = SPECIAL_CHARACTERS[rng.random_range(0..SPECIAL_CHARACTERS.len())];
        chars.push(char::from(special));
    }
    chars.shuffle(&mut rng);
    chars.into_iter().collect()
}
