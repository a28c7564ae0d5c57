//! secp256k1 scalar/point arithmetic (component C1 of spec.md §4.1).
//!
//! `Scalar` and `Point` wrap `secp256k1::SecretKey`/`PublicKey` the same way
//! the teacher's `multisig::crypto::secp256k1` module does: both are an
//! `Option<_>`, with `None` standing in for the additive identity (the zero
//! scalar / the point at infinity), since neither `SecretKey` nor `PublicKey`
//! can represent zero directly. Unlike the teacher we only ever need one
//! curve, so there is no `ECPoint`/`ECScalar` trait split here — just the
//! concrete types spec.md needs.

use std::{collections::BTreeSet, fmt};

use lazy_static::lazy_static;
use num_bigint::BigUint;
use secp256k1::constants::{CURVE_ORDER, SECRET_KEY_SIZE};
use zeroize::Zeroize;

use crate::error::{CustodyError, Result};

type SK = secp256k1::SecretKey;
type PK = secp256k1::PublicKey;

pub const COMPRESSED_POINT_SIZE: usize = 33;
pub const SCALAR_SIZE: usize = 32;

const POINT_AT_INFINITY_COMPRESSED: [u8; COMPRESSED_POINT_SIZE] = [0; COMPRESSED_POINT_SIZE];
const ZERO_SCALAR_BYTES: [u8; SCALAR_SIZE] = [0; SCALAR_SIZE];

const GENERATOR_COMPRESSED: [u8; 33] = [
	0x02, 0x79, 0xBE, 0x66, 0x7E, 0xF9, 0xDC, 0xBB, 0xAC, 0x55, 0xA0, 0x62, 0x95, 0xCE, 0x87, 0x0B,
	0x07, 0x02, 0x9B, 0xFC, 0xDB, 0x2D, 0xCE, 0x28, 0xD9, 0x59, 0xF2, 0x81, 0x5B, 0x16, 0xF8, 0x17,
	0x98,
];

lazy_static! {
	static ref GENERATOR: Point = Point(Some(PK::from_slice(&GENERATOR_COMPRESSED).unwrap()));
	static ref GROUP_ORDER: BigUint = BigUint::from_bytes_be(&CURVE_ORDER);
}

/// A scalar mod the secp256k1 group order. `None` represents the zero scalar
/// (which `secp256k1::SecretKey` cannot hold directly, as it must be nonzero).
#[derive(Clone, PartialEq, Eq)]
pub struct Scalar(Option<SK>);

impl fmt::Debug for Scalar {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "Scalar(<redacted>)")
	}
}

/// A secp256k1 curve point. `None` represents the point at infinity (the
/// group identity), which is a legitimate intermediate value in sums (spec
/// §4.1) but an internal error if it ever reaches the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Point(Option<PK>);

impl Scalar {
	/// Sample uniformly from `[1, n)`. `SecretKey::new` guarantees a nonzero,
	/// in-range value.
	pub fn random(rng: &mut impl rand::RngCore) -> Self {
		Scalar(Some(SK::new(rng)))
	}

	pub fn zero() -> Self {
		Scalar(None)
	}

	pub fn is_zero(&self) -> bool {
		self.0.is_none()
	}

	pub fn from_u32(x: u32) -> Self {
		if x == 0 {
			return Scalar(None)
		}
		let mut array = [0u8; SECRET_KEY_SIZE];
		array[28..].copy_from_slice(&x.to_be_bytes());
		Scalar(Some(SK::from_slice(&array).expect("u32 is within group order")))
	}

	/// Reduce an arbitrary big-endian value mod the group order. Used by the
	/// nonce derivator (spec §4.3 step 3) to turn an HMAC output into a scalar.
	pub fn from_bytes_mod_order(bytes: &[u8]) -> Self {
		let mut x = BigUint::from_bytes_be(bytes);
		x %= &*GROUP_ORDER;
		Self::from_reduced_bigint(&x)
	}

	fn from_reduced_bigint(x: &BigUint) -> Self {
		use num_traits::Zero;
		if x.is_zero() {
			return Scalar(None)
		}
		let x_bytes = x.to_bytes_be();
		let mut array = [0u8; SECRET_KEY_SIZE];
		array[SECRET_KEY_SIZE - x_bytes.len()..].copy_from_slice(&x_bytes);
		Scalar(Some(SK::from_slice(&array).expect("reduced value is within group order")))
	}

	/// Modular inverse via Fermat's little theorem (`a^(n-2) mod n`); `None`
	/// for the zero scalar.
	pub fn invert(&self) -> Option<Self> {
		self.0.map(|sk| {
			let x = BigUint::from_bytes_be(sk.as_ref());
			let inverse = x.modpow(&(&*GROUP_ORDER - 2u32), &GROUP_ORDER);
			Self::from_reduced_bigint(&inverse)
		})
	}

	fn as_bytes(&self) -> [u8; SCALAR_SIZE] {
		match &self.0 {
			Some(sk) => {
				let mut out = [0u8; SCALAR_SIZE];
				out.copy_from_slice(sk.as_ref());
				out
			},
			None => ZERO_SCALAR_BYTES,
		}
	}

	/// Raw 32-byte big-endian encoding (spec §6: the wire form DKG shares are
	/// RSA-OAEP-encrypted under, as opposed to [`Scalar::to_hex`]'s text form).
	pub fn to_bytes(&self) -> [u8; SCALAR_SIZE] {
		self.as_bytes()
	}

	pub fn from_bytes(bytes: &[u8; SCALAR_SIZE]) -> Result<Self> {
		if *bytes == ZERO_SCALAR_BYTES {
			return Ok(Scalar(None))
		}
		SK::from_slice(bytes)
			.map(|sk| Scalar(Some(sk)))
			.map_err(|e| CustodyError::MalformedContent { path: "scalar".into(), detail: e.to_string() })
	}

	/// 64 hex chars, big-endian, zero-padded (spec §6 wire format).
	pub fn to_hex(&self) -> String {
		hex::encode(self.as_bytes())
	}

	pub fn from_hex(s: &str) -> Result<Self> {
		let bytes = hex::decode(s).map_err(|e| CustodyError::MalformedContent {
			path: "scalar".into(),
			detail: e.to_string(),
		})?;
		if bytes.len() != SCALAR_SIZE {
			return Err(CustodyError::MalformedContent {
				path: "scalar".into(),
				detail: format!("expected {SCALAR_SIZE} bytes, got {}", bytes.len()),
			})
		}
		if bytes == ZERO_SCALAR_BYTES {
			return Ok(Scalar(None))
		}
		let array: [u8; SCALAR_SIZE] = bytes.try_into().unwrap();
		SK::from_slice(&array)
			.map(|sk| Scalar(Some(sk)))
			.map_err(|e| CustodyError::MalformedContent { path: "scalar".into(), detail: e.to_string() })
	}
}

impl Drop for Scalar {
	fn drop(&mut self) {
		// SecretKey zeroizes itself on drop; this clears our own backing bytes
		// defensively in case that guarantee ever changes upstream.
		if let Some(sk) = self.0.as_mut() {
			let mut bytes = *sk.as_ref();
			bytes.zeroize();
		}
	}
}

impl Default for Scalar {
	fn default() -> Self {
		Self::zero()
	}
}

impl std::ops::Add for Scalar {
	type Output = Scalar;
	fn add(self, rhs: Self) -> Scalar {
		match (self.0, rhs.0) {
			(None, rhs) => Scalar(rhs),
			(lhs, None) => Scalar(lhs),
			(Some(lhs), Some(rhs)) => Scalar(lhs.add_tweak(&rhs.into()).ok()),
		}
	}
}

impl std::ops::Sub for Scalar {
	type Output = Scalar;
	fn sub(self, rhs: Self) -> Scalar {
		match rhs.0 {
			None => self,
			Some(rhs) => self + Scalar(Some(rhs.negate())),
		}
	}
}

impl std::ops::Mul for Scalar {
	type Output = Scalar;
	fn mul(self, rhs: Self) -> Scalar {
		match (self.0, rhs.0) {
			(None, _) | (_, None) => Scalar(None),
			(Some(lhs), Some(rhs)) => Scalar(lhs.mul_tweak(&rhs.into()).ok()),
		}
	}
}

impl std::iter::Sum for Scalar {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Scalar::zero(), |a, b| a + b)
	}
}

impl Point {
	pub fn generator() -> Point {
		*GENERATOR
	}

	pub fn identity() -> Point {
		Point(None)
	}

	pub fn is_identity(&self) -> bool {
		self.0.is_none()
	}

	pub fn from_scalar(scalar: &Scalar) -> Point {
		Self::generator() * scalar.clone()
	}

	/// 33 bytes: 0x02/0x03 parity prefix + big-endian x. Spec §4.1:
	/// serialising the identity is an internal error.
	pub fn to_compressed_bytes(&self) -> Result<[u8; COMPRESSED_POINT_SIZE]> {
		match self.0 {
			Some(pk) => Ok(pk.serialize()),
			None => Err(CustodyError::MalformedContent {
				path: "point".into(),
				detail: "attempted to serialise the point at infinity".into(),
			}),
		}
	}

	/// 66 hex chars, the wire form of [`Point::to_compressed_bytes`].
	pub fn to_compressed_hex(&self) -> Result<String> {
		self.to_compressed_bytes().map(hex::encode)
	}

	pub fn from_compressed_hex(s: &str) -> Result<Self> {
		let bytes = hex::decode(s).map_err(|e| CustodyError::MalformedContent {
			path: "point".into(),
			detail: e.to_string(),
		})?;
		if bytes.len() != COMPRESSED_POINT_SIZE {
			return Err(CustodyError::MalformedContent {
				path: "point".into(),
				detail: format!("expected {COMPRESSED_POINT_SIZE} bytes, got {}", bytes.len()),
			})
		}
		if bytes == POINT_AT_INFINITY_COMPRESSED {
			return Ok(Point(None))
		}
		PK::from_slice(&bytes)
			.map(|pk| Point(Some(pk)))
			.map_err(|e| CustodyError::MalformedContent { path: "point".into(), detail: e.to_string() })
	}
}

impl Default for Point {
	fn default() -> Self {
		Point::identity()
	}
}

impl std::ops::Add for Point {
	type Output = Point;
	fn add(self, rhs: Self) -> Point {
		match (self.0, rhs.0) {
			(None, rhs) => Point(rhs),
			(lhs, None) => Point(lhs),
			(Some(lhs), Some(rhs)) => Point(lhs.combine(&rhs).ok()),
		}
	}
}

impl std::ops::Neg for Point {
	type Output = Point;
	fn neg(self) -> Point {
		Point(self.0.map(|pk| pk.negate(secp256k1::SECP256K1)))
	}
}

impl std::ops::Sub for Point {
	type Output = Point;
	fn sub(self, rhs: Self) -> Point {
		self + (-rhs)
	}
}

impl std::ops::Mul<Scalar> for Point {
	type Output = Point;
	fn mul(self, scalar: Scalar) -> Point {
		match (self.0, scalar.0) {
			(None, _) | (_, None) => Point(None),
			(Some(point), Some(scalar)) =>
				Point(point.mul_tweak(secp256k1::SECP256K1, &scalar.into()).ok()),
		}
	}
}

impl std::iter::Sum for Point {
	fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
		iter.fold(Point::identity(), |a, b| a + b)
	}
}

/// Evaluate `f(x) = c0 + c1*x + c2*x^2 + ...` given coefficients
/// `[c0, c1, c2, ...]`, at the integer point `x`, via Horner's method.
pub fn evaluate_polynomial(coefficients: &[Scalar], x: u32) -> Scalar {
	let x = Scalar::from_u32(x);
	coefficients
		.iter()
		.rev()
		.cloned()
		.reduce(|acc, c| acc * x.clone() + c)
		.unwrap_or_else(Scalar::zero)
}

/// `λ_i = Π_{j ∈ S, j≠i} j · (j − i)^{-1} mod n` (spec Glossary).
pub fn lagrange_coefficient_at_zero(indices: &BTreeSet<u32>, i: u32) -> Scalar {
	let mut num = Scalar::from_u32(1);
	let mut den = Scalar::from_u32(1);

	for &j in indices {
		if j == i {
			continue
		}
		let j_s = Scalar::from_u32(j);
		let i_s = Scalar::from_u32(i);
		num = num * j_s.clone();
		den = den * (j_s - i_s);
	}

	num * den.invert().expect("indices are distinct, so the denominator is nonzero")
}

#[cfg(test)]
mod tests {
	use super::*;
	use rand::SeedableRng;

	fn rng() -> rand::rngs::StdRng {
		rand::rngs::StdRng::from_seed([7; 32])
	}

	#[test]
	fn point_round_trip() {
		let mut rng = rng();
		let s = Scalar::random(&mut rng);
		let p = Point::from_scalar(&s);
		let hex = p.to_compressed_hex().unwrap();
		assert_eq!(hex.len(), 66);
		let p2 = Point::from_compressed_hex(&hex).unwrap();
		assert_eq!(p, p2);
	}

	#[test]
	fn identity_serialisation_is_an_error() {
		assert!(Point::identity().to_compressed_hex().is_err());
	}

	#[test]
	fn negation_round_trips() {
		let mut rng = rng();
		let s = Scalar::random(&mut rng);
		let p = Point::from_scalar(&s);
		let neg = -p;
		assert_ne!(p.to_compressed_hex().unwrap(), neg.to_compressed_hex().unwrap());
		assert_eq!(p, -neg);
		assert!((p + neg).is_identity());
	}

	#[test]
	fn polynomial_reconstruction_via_lagrange() {
		// f(x) = 4 + 5x + 2x^2
		let secret = Scalar::from_u32(4);
		let coefficients = vec![secret.clone(), Scalar::from_u32(5), Scalar::from_u32(2)];

		let indices: BTreeSet<u32> = [1, 2, 3].into_iter().collect();
		let shares: Vec<(u32, Scalar)> =
			indices.iter().map(|&i| (i, evaluate_polynomial(&coefficients, i))).collect();

		let reconstructed: Scalar = shares
			.into_iter()
			.map(|(i, share)| lagrange_coefficient_at_zero(&indices, i) * share)
			.sum();

		assert_eq!(reconstructed, secret);
	}

	#[test]
	fn lagrange_with_single_party_is_one() {
		let indices: BTreeSet<u32> = [1].into_iter().collect();
		assert_eq!(lagrange_coefficient_at_zero(&indices, 1), Scalar::from_u32(1));
	}

	#[test]
	fn scalar_hex_round_trip_pads_zeros() {
		let s = Scalar::from_u32(1);
		let hex = s.to_hex();
		assert_eq!(hex.len(), 64);
		assert_eq!(Scalar::from_hex(&hex).unwrap(), s);
	}
}
