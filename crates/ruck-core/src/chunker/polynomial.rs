use std::fmt;
use std::str::FromStr;

use rand::Rng;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use ruck_types::RuckError;

/// Degree of the per-repository chunking polynomials. Fingerprints fit in
/// 53 bits, leaving headroom for the byte-append step of the rolling hash.
pub const POLYNOMIAL_DEGREE: i32 = 53;

/// A polynomial over GF(2), represented by its coefficient bits.
///
/// Bit `i` of the inner value is the coefficient of `x^i`. Each repository
/// stores one irreducible polynomial of degree 53 in its config; chunk
/// boundaries are deterministic for a given (polynomial, byte stream) pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Polynomial(pub u64);

impl Polynomial {
    /// Degree of the polynomial; -1 for the zero polynomial.
    pub fn deg(self) -> i32 {
        63 - self.0.leading_zeros() as i32
    }

    fn add(self, other: Polynomial) -> Polynomial {
        Polynomial(self.0 ^ other.0)
    }

    /// Remainder of polynomial division by `m`.
    fn rem(self, m: Polynomial) -> Polynomial {
        let dm = m.deg();
        let mut res = self.0;
        loop {
            let dr = Polynomial(res).deg();
            if dr < dm {
                return Polynomial(res);
            }
            res ^= m.0 << (dr - dm);
        }
    }

    /// `self * y mod m`, with shift-and-reduce so intermediates never
    /// overflow 64 bits.
    fn mul_mod(self, y: Polynomial, m: Polynomial) -> Polynomial {
        let mut res = Polynomial(0);
        let mut x = self.rem(m);
        let dy = y.deg();
        for i in 0..=dy.max(0) {
            if dy >= 0 && (y.0 >> i) & 1 == 1 {
                res = res.add(x);
            }
            x = Polynomial(x.0 << 1).rem(m);
        }
        res.rem(m)
    }

    fn gcd(self, other: Polynomial) -> Polynomial {
        let (mut a, mut b) = (self, other);
        while b.0 != 0 {
            let r = a.rem(b);
            a = b;
            b = r;
        }
        a
    }

    /// `x^(2^p) + x mod g`, computed by `p` modular squarings of `x`.
    fn qp(p: u32, g: Polynomial) -> Polynomial {
        let x = Polynomial(2);
        let mut res = x.rem(g);
        for _ in 0..p {
            res = res.mul_mod(res, g);
        }
        res.add(x).rem(g)
    }

    /// Rabin's irreducibility test over GF(2): a polynomial `f` of degree
    /// `n` is irreducible iff `f` divides `x^(2^n) - x` and
    /// `gcd(f, x^(2^(n/q)) - x) = 1` for every prime divisor `q` of `n`.
    pub fn irreducible(self) -> bool {
        let n = self.deg();
        if n <= 0 {
            return false;
        }
        let n = n as u32;
        for q in prime_divisors(n) {
            if Self::qp(n / q, self).gcd(self).deg() > 0 {
                return false;
            }
        }
        Self::qp(n, self).0 == 0
    }

    /// Draw random degree-53 polynomials until one is irreducible.
    pub fn random(rng: &mut impl Rng) -> Polynomial {
        loop {
            // Exact degree 53, odd (a zero constant term is divisible by x).
            let bits = (rng.gen::<u64>() & ((1u64 << POLYNOMIAL_DEGREE) - 1))
                | (1u64 << POLYNOMIAL_DEGREE)
                | 1;
            let candidate = Polynomial(bits);
            if candidate.irreducible() {
                return candidate;
            }
        }
    }
}

fn prime_divisors(mut n: u32) -> Vec<u32> {
    let mut divisors = Vec::new();
    let mut p = 2;
    while p * p <= n {
        if n % p == 0 {
            divisors.push(p);
            while n % p == 0 {
                n /= p;
            }
        }
        p += 1;
    }
    if n > 1 {
        divisors.push(n);
    }
    divisors
}

impl fmt::Display for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl fmt::Debug for Polynomial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Polynomial({:x})", self.0)
    }
}

impl FromStr for Polynomial {
    type Err = RuckError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bits = u64::from_str_radix(s, 16)
            .map_err(|_| RuckError::InvalidFormat(format!("invalid polynomial '{s}'")))?;
        Ok(Polynomial(bits))
    }
}

impl Serialize for Polynomial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

struct PolynomialVisitor;

impl Visitor<'_> for PolynomialVisitor {
    type Value = Polynomial;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a hex-encoded polynomial")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Polynomial, E> {
        v.parse().map_err(|_| E::invalid_value(de::Unexpected::Str(v), &self))
    }
}

impl<'de> Deserialize<'de> for Polynomial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_str(PolynomialVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A well-known irreducible degree-53 polynomial.
    pub(crate) const KNOWN_IRREDUCIBLE: Polynomial = Polynomial(0x3DA3358B4DC173);

    #[test]
    fn degree() {
        assert_eq!(Polynomial(0).deg(), -1);
        assert_eq!(Polynomial(1).deg(), 0);
        assert_eq!(Polynomial(2).deg(), 1);
        assert_eq!(KNOWN_IRREDUCIBLE.deg(), 53);
    }

    #[test]
    fn rem_reduces_degree() {
        let m = Polynomial(0b1011); // x^3 + x + 1, irreducible
        let r = Polynomial(0b11111111).rem(m);
        assert!(r.deg() < m.deg());
    }

    #[test]
    fn gcd_of_coprime_is_one() {
        // x^3 + x + 1 and x^3 + x^2 + 1 are both irreducible, hence coprime.
        let a = Polynomial(0b1011);
        let b = Polynomial(0b1101);
        assert_eq!(a.gcd(b), Polynomial(1));
    }

    #[test]
    fn known_polynomial_is_irreducible() {
        assert!(KNOWN_IRREDUCIBLE.irreducible());
    }

    #[test]
    fn small_irreducibles() {
        // x^2 + x + 1 is the only irreducible quadratic over GF(2).
        assert!(Polynomial(0b111).irreducible());
        // x^2 + 1 = (x + 1)^2
        assert!(!Polynomial(0b101).irreducible());
        // x^2 + x = x(x + 1)
        assert!(!Polynomial(0b110).irreducible());
    }

    #[test]
    fn random_polynomial_has_degree_53() {
        let mut rng = rand::thread_rng();
        let p = Polynomial::random(&mut rng);
        assert_eq!(p.deg(), POLYNOMIAL_DEGREE);
        assert!(p.irreducible());
    }

    #[test]
    fn hex_roundtrip() {
        let p = KNOWN_IRREDUCIBLE;
        let parsed: Polynomial = p.to_string().parse().unwrap();
        assert_eq!(p, parsed);

        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(json, "\"3da3358b4dc173\"");
        let back: Polynomial = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn prime_divisor_sets() {
        assert_eq!(prime_divisors(53), vec![53]);
        assert_eq!(prime_divisors(12), vec![2, 3]);
        assert_eq!(prime_divisors(1), Vec::<u32>::new());
    }
}
