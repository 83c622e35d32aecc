//! Autenticação dos lotes: hash salgado do segredo compartilhado.
//!
//! `auth = hex(sha256(salt_utf8 || segredo))`. Não é HMAC; é uma comparação
//! de hash com salt novo por requisição. O salt tem 20 letras maiúsculas.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Tamanho do salt gerado pelo cliente.
pub const SALT_LEN: usize = 20;

/// Falhas de autenticação (sempre 403 no servidor).
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Nenhuma credencial no payload")]
    Missing,

    #[error("Digest não é hexadecimal válido: {0}")]
    MalformedDigest(#[from] hex::FromHexError),

    #[error("Digest não confere")]
    DigestMismatch,

    #[error("Senha em texto puro não confere")]
    PasswordMismatch,
}

/// Gera um salt novo de [`SALT_LEN`] letras `A`–`Z`.
pub fn generate_salt<R: Rng + ?Sized>(rng: &mut R) -> String {
    (0..SALT_LEN)
        .map(|_| char::from(rng.gen_range(b'A'..=b'Z')))
        .collect()
}

/// Salt novo a partir do gerador da thread.
pub fn fresh_salt() -> String {
    generate_salt(&mut rand::thread_rng())
}

/// `sha256(salt || segredo)` em bytes.
pub fn digest_bytes(salt: &str, secret: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret);
    hasher.finalize().into()
}

/// Digest em hexadecimal minúsculo, como vai no campo `auth`.
pub fn compute_digest(salt: &str, secret: &[u8]) -> String {
    hex::encode(digest_bytes(salt, secret))
}

/// Credenciais extraídas de um payload recebido.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Esquema atual: salt + digest.
    Salted { salt: String, auth: String },
    /// Esquema legado: senha em texto puro.
    Cleartext(String),
}

impl Credentials {
    /// Verifica as credenciais contra o segredo configurado no servidor.
    pub fn verify(&self, secret: &str) -> Result<(), AuthError> {
        match self {
            Credentials::Salted { salt, auth } => {
                let actual = hex::decode(auth)?;
                let expected = digest_bytes(salt, secret.as_bytes());
                if constant_time_eq(&expected, &actual) {
                    Ok(())
                } else {
                    Err(AuthError::DigestMismatch)
                }
            }
            Credentials::Cleartext(password) => {
                if constant_time_eq(password.as_bytes(), secret.as_bytes()) {
                    Ok(())
                } else {
                    Err(AuthError::PasswordMismatch)
                }
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
