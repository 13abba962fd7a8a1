//! Random password generator

use crate::error::{Error, Result};
use rand::rngs::OsRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

const LOWERCASE: &str = "abcdefghijklmnopqrstuvwxyz";
const UPPERCASE: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &str = "0123456789";
const SPECIALS: &str = "!\"#$%&'()*+,-./:;<=>?@[\\]^_`{|}~";

/// Characters easily confused with one another
const LOOKALIKE: &str = "0Oo1lI|8B5S2Z`'\"";

/// What a generated password may contain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PasswordPolicy {
    pub length: usize,
    pub lowercase: bool,
    pub uppercase: bool,
    pub digits: bool,
    pub specials: bool,
    /// Leave out characters that look alike
    pub exclude_lookalike: bool,
    /// At least one character from every selected group
    pub every_group: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        PasswordPolicy {
            length: 16,
            lowercase: true,
            uppercase: true,
            digits: true,
            specials: false,
            exclude_lookalike: false,
            every_group: true,
        }
    }
}

impl PasswordPolicy {
    /// Character groups selected by the policy
    fn groups(&self) -> Vec<Vec<char>> {
        [
            (self.lowercase, LOWERCASE),
            (self.uppercase, UPPERCASE),
            (self.digits, DIGITS),
            (self.specials, SPECIALS),
        ]
        .iter()
        .filter(|(selected, _)| *selected)
        .map(|(_, chars)| {
            chars
                .chars()
                .filter(|c| !self.exclude_lookalike || !LOOKALIKE.contains(*c))
                .collect::<Vec<char>>()
        })
        .filter(|group| !group.is_empty())
        .collect()
    }

    /// Entropy in bits of a password generated under this policy
    pub fn entropy_bits(&self) -> f64 {
        let pool: usize = self.groups().iter().map(Vec::len).sum();
        if pool == 0 {
            return 0.0;
        }
        self.length as f64 * (pool as f64).log2()
    }
}

/// Generate a password from the operating system's random source
pub fn generate_password(policy: &PasswordPolicy) -> Result<Zeroizing<String>> {
    let groups = policy.groups();
    if groups.is_empty() {
        return Err(Error::ValidationError(
            "Select at least one character group".to_string(),
        ));
    }
    if policy.length == 0 {
        return Err(Error::ValidationError(
            "Password length must be greater than 0".to_string(),
        ));
    }
    if policy.every_group && policy.length < groups.len() {
        return Err(Error::ValidationError(format!(
            "Password length must be at least {} to use every character group",
            groups.len()
        )));
    }

    let mut rng = OsRng;
    let pool: Vec<char> = groups.iter().flatten().copied().collect();
    let mut password: Zeroizing<Vec<char>> = Zeroizing::new(Vec::with_capacity(policy.length));

    if policy.every_group {
        for group in &groups {
            if let Some(c) = group.choose(&mut rng) {
                password.push(*c);
            }
        }
    }
    while password.len() < policy.length {
        if let Some(c) = pool.choose(&mut rng) {
            password.push(*c);
        }
    }
    password.shuffle(&mut rng);

    Ok(Zeroizing::new(password.iter().collect()))
}
