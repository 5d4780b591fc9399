use rand::Rng;

// 64-bit Diffie-Hellman over the prime field p = 2^64 - 59, generator 5.
// Toy-strength by modern standards; it only seeds the session nonces, it
// does not authenticate the peer.

const P: u64 = 0xffff_ffff_ffff_ffc5;
const G: u64 = 5;

fn mul_mod_p(a: u64, b: u64) -> u64 {
    ((a as u128 * b as u128) % P as u128) as u64
}

fn pow_mod_p(mut a: u64, mut b: u64) -> u64 {
    let mut result: u64 = 1;
    a %= P;
    while b > 0 {
        if b & 1 == 1 {
            result = mul_mod_p(result, a);
        }
        a = mul_mod_p(a, a);
        b >>= 1;
    }
    result
}

/// Generate a fresh `(private, public)` key pair.
pub fn key_pair<R: Rng>(rng: &mut R) -> (u64, u64) {
    let private = loop {
        let candidate: u64 = rng.gen();
        if candidate != 0 {
            break candidate;
        }
    };
    (private, public_key(private))
}

pub fn public_key(private: u64) -> u64 {
    pow_mod_p(G, private)
}

/// Derive the shared secret from our private key and the peer's public key.
pub fn secret(private: u64, peer_public: u64) -> u64 {
    pow_mod_p(peer_public, private)
}
