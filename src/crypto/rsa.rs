//! Textbook RSA over 64-bit moduli.
//!
//! This is the pluggable encryption capability the relay layer calls through
//! the [`Cipher`] trait. It offers no real security: keys are small, there is
//! no padding, and identical plaintexts encrypt identically.
//!
//! Plaintext is turned into integers by writing each UTF-8 byte as three
//! decimal digits and cutting the digit string into chunks that are one digit
//! shorter than `n`. Each chunk is prefixed with a `1` so that leading zeros
//! survive the round trip. A prefixed chunk is therefore always below
//! `10^(digits(n) - 1) <= n`.

use crate::utils::{CryptoError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Public exponent used whenever it is coprime with λ(n)
pub const DEFAULT_PUBLIC_EXPONENT: u64 = 65537;

/// Smallest modulus that leaves room for one digit per chunk
pub const MIN_MODULUS: u64 = 100;

const DIGITS_PER_BYTE: usize = 3;

/// Public half of a key pair: `(n, e)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey {
    /// Modulus
    pub n: u64,
    /// Public exponent
    pub e: u64,
}

/// Private half of a key pair: `(n, d)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey {
    /// Modulus
    pub n: u64,
    /// Private exponent
    pub d: u64,
}

/// Matching public and private keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPair {
    /// Shared with peers through address books
    pub public: PublicKey,
    /// Never leaves the local profile
    pub private: PrivateKey,
}

impl PublicKey {
    /// The `(0, 0)` sentinel meaning "communicate unencrypted"
    pub const PLAINTEXT: Self = Self { n: 0, e: 0 };

    /// Returns true for the unencrypted sentinel
    pub fn is_plaintext(&self) -> bool {
        self.n == 0 && self.e == 0
    }
}

/// Encryption capability used by the message codec
pub trait Cipher: Send + Sync {
    /// Encrypt `plaintext` for the holder of `key`'s private half
    fn encrypt(&self, key: &PublicKey, plaintext: &str) -> Result<Vec<u64>>;

    /// Decrypt a ciphertext produced by [`Cipher::encrypt`]
    fn decrypt(&self, key: &PrivateKey, ciphertext: &[u64]) -> Result<String>;
}

/// Naive chunked RSA
#[derive(Debug, Clone, Copy, Default)]
pub struct TextbookRsa;

impl Cipher for TextbookRsa {
    fn encrypt(&self, key: &PublicKey, plaintext: &str) -> Result<Vec<u64>> {
        let width = chunk_width(key.n)?;
        if key.e == 0 {
            return Err(invalid("public exponent must be non-zero"));
        }

        let digits: String = plaintext
            .bytes()
            .map(|b| format!("{:0width$}", b, width = DIGITS_PER_BYTE))
            .collect();

        digits
            .as_bytes()
            .chunks(width)
            .map(|chunk| {
                // Digits are ASCII, so the chunk is valid UTF-8
                let marked = format!("1{}", String::from_utf8_lossy(chunk));
                let value: u64 = marked
                    .parse()
                    .map_err(|_| invalid(&format!("chunk '{marked}' is not an integer")))?;
                encrypt_block(value, key)
            })
            .collect()
    }

    fn decrypt(&self, key: &PrivateKey, ciphertext: &[u64]) -> Result<String> {
        chunk_width(key.n)?;
        if key.d == 0 {
            return Err(invalid("private exponent must be non-zero"));
        }

        let mut digits = String::new();
        for &block in ciphertext {
            if block >= key.n {
                return Err(invalid(&format!("ciphertext block {block} >= n {}", key.n)));
            }
            let plain = mod_pow(block, key.d, key.n).to_string();
            let stripped = plain.strip_prefix('1').ok_or_else(|| CryptoError::Decryption {
                reason: "chunk marker missing, wrong key?".to_string(),
            })?;
            digits.push_str(stripped);
        }

        if digits.len() % DIGITS_PER_BYTE != 0 {
            return Err(CryptoError::Decryption {
                reason: format!("{} digits do not split into bytes", digits.len()),
            }
            .into());
        }

        let bytes = digits
            .as_bytes()
            .chunks(DIGITS_PER_BYTE)
            .map(|code| {
                std::str::from_utf8(code)
                    .ok()
                    .and_then(|s| s.parse::<u8>().ok())
                    .ok_or_else(|| CryptoError::Decryption {
                        reason: "byte code out of range".to_string(),
                    })
            })
            .collect::<std::result::Result<Vec<u8>, CryptoError>>()?;

        String::from_utf8(bytes).map_err(|e| {
            CryptoError::Decryption {
                reason: e.to_string(),
            }
            .into()
        })
    }
}

fn invalid(reason: &str) -> crate::utils::ChatError {
    CryptoError::InvalidArgument {
        reason: reason.to_string(),
    }
    .into()
}

/// Number of payload digits per chunk for modulus `n`
fn chunk_width(n: u64) -> Result<usize> {
    if n < MIN_MODULUS {
        return Err(invalid(&format!("modulus {n} is below {MIN_MODULUS}")));
    }
    // One digit for the marker, one digit of headroom below n
    Ok(n.to_string().len() - 2)
}

fn encrypt_block(value: u64, key: &PublicKey) -> Result<u64> {
    if value >= key.n {
        return Err(invalid(&format!("chunk {value} >= n {}", key.n)));
    }
    Ok(mod_pow(value, key.e, key.n))
}

fn mod_mul(a: u64, b: u64, m: u64) -> u64 {
    ((u128::from(a) * u128::from(b)) % u128::from(m)) as u64
}

fn mod_pow(mut base: u64, mut exp: u64, m: u64) -> u64 {
    if m == 1 {
        return 0;
    }
    let mut result = 1;
    base %= m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mod_mul(result, base, m);
        }
        base = mod_mul(base, base, m);
        exp >>= 1;
    }
    result
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn lcm(a: u64, b: u64) -> u64 {
    a / gcd(a, b) * b
}

/// Modular inverse of `a` mod `m`, if it exists
fn mod_inverse(a: u64, m: u64) -> Option<u64> {
    let (mut old_r, mut r) = (i128::from(a), i128::from(m));
    let (mut old_s, mut s) = (1i128, 0i128);
    while r != 0 {
        let q = old_r / r;
        (old_r, r) = (r, old_r - q * r);
        (old_s, s) = (s, old_s - q * s);
    }
    if old_r != 1 {
        return None;
    }
    Some(old_s.rem_euclid(i128::from(m)) as u64)
}

/// Deterministic Miller-Rabin for all 64-bit integers
pub fn is_prime(n: u64) -> bool {
    const WITNESSES: [u64; 12] = [2, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];

    if n < 2 {
        return false;
    }
    for &p in &WITNESSES {
        if n % p == 0 {
            return n == p;
        }
    }

    let mut d = n - 1;
    let mut r = 0;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }

    'witness: for &a in &WITNESSES {
        let mut x = mod_pow(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 1..r {
            x = mod_mul(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

fn random_prime<R: Rng>(rng: &mut R, bits: u32) -> u64 {
    let low = 1u64 << (bits - 1);
    let high = (1u64 << bits) - 1;
    loop {
        let candidate = rng.gen_range(low..=high) | 1;
        if is_prime(candidate) {
            return candidate;
        }
    }
}

impl KeyPair {
    /// Build a key pair from two distinct primes
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if the primes are unusable
    pub fn from_primes(p: u64, q: u64) -> Result<Self> {
        if p == q || !is_prime(p) || !is_prime(q) {
            return Err(CryptoError::KeyGeneration {
                reason: format!("{p} and {q} must be distinct primes"),
            }
            .into());
        }

        let n = p.checked_mul(q).ok_or_else(|| CryptoError::KeyGeneration {
            reason: "modulus overflows 64 bits".to_string(),
        })?;
        if n < MIN_MODULUS {
            return Err(CryptoError::KeyGeneration {
                reason: format!("modulus {n} is below {MIN_MODULUS}"),
            }
            .into());
        }

        // Carmichael function of n
        let lambda = lcm(p - 1, q - 1);

        let e = if DEFAULT_PUBLIC_EXPONENT < lambda && gcd(DEFAULT_PUBLIC_EXPONENT, lambda) == 1 {
            DEFAULT_PUBLIC_EXPONENT
        } else {
            (2..lambda)
                .rev()
                .find(|&c| is_prime(c) && gcd(c, lambda) == 1)
                .ok_or_else(|| CryptoError::KeyGeneration {
                    reason: format!("no public exponent coprime with {lambda}"),
                })?
        };

        let d = mod_inverse(e, lambda).ok_or_else(|| CryptoError::KeyGeneration {
            reason: "public exponent has no inverse".to_string(),
        })?;

        Ok(Self {
            public: PublicKey { n, e },
            private: PrivateKey { n, d },
        })
    }

    /// Generate a fresh key pair with a modulus just under 62 bits
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let p = random_prime(&mut rng, 31);
            let q = random_prime(&mut rng, 31);
            if let Ok(pair) = Self::from_primes(p, q) {
                return pair;
            }
        }
    }
}
