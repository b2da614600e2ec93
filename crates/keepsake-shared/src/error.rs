use thiserror::Error;

#[derive(Error, Debug)]
pub enum KeepsakeError {
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid capsule: {0}")]
    InvalidCapsule(String),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CryptoError {
    /// Tag did not verify: tampered blob or wrong master key.
    #[error("Authentication failed: ciphertext was tampered with or the key is wrong")]
    AuthenticationFailure,

    #[error("Malformed ciphertext: {0}")]
    MalformedCiphertext(String),

    /// KDF or cipher primitive rejected its parameters. Not retried.
    #[error("Cryptographic primitive unavailable: {0}")]
    CryptoUnavailable(String),
}
