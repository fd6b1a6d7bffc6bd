//! Replacement credential generation.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::secrets::SecretString;

/// Random alphanumeric credential of `length` characters.
pub fn generate_credential(length: usize) -> SecretString {
    let value: String =
        rand::thread_rng().sample_iter(&Alphanumeric).take(length).map(char::from).collect();
    SecretString::new(value)
}
