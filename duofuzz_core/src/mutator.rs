use crate::input::{FieldValue, Payload};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum representable signed 32-bit integer, the boundary constant used by
/// [`MutationKind::BoundaryValue`].
pub const BOUNDARY_VALUE: i32 = i32::MAX;
/// Field consumed as a divisor by the catalog application.
pub const DEFAULT_DIVISOR_FIELD: &str = "divide_by";
/// Field that receives the serialization-breaking fragment.
pub const DEFAULT_CORRUPTION_FIELD: &str = "extra_field";
/// Number of zeros appended to `1` for oversize numeric values (`10^200`).
pub const DEFAULT_OVERSIZE_DIGITS: usize = 200;
/// Length of an oversize blob, larger than the 512-byte ATT attribute limit.
pub const DEFAULT_OVERSIZE_BLOB_LEN: usize = 1024;
/// Number of repeated characters in a pathological-repetition value.
pub const DEFAULT_REPETITION_LEN: usize = 100_000;

const FLIP_CHARS: &[u8] = b"!@#$%^&*()_+-=[]{}|;:,.<>?";
const BYTE_BOUNDARY_VALUES: [u8; 4] = [0x00, 0xFF, 0x7F, 0x80];
const BYTE_BOUNDARY_PROBABILITY: f64 = 0.4;
const SPECIAL_NUMBERS: [&str; 6] = [
    "-1",
    "NaN",
    "Infinity",
    "0.000001",
    "-2147483648",
    "💰💰💰",
];
/// Opens a string that is never closed, so the wire form cannot parse.
const CORRUPTION_FRAGMENT: &str = "\"Something extra,}";
const INJECTION_FALLBACK_FIELD: &str = "object";

/// A named transformation strategy.
///
/// The set is fixed at compile time. Kinds below `PathologicalRepetition` target text and
/// numeric fields; the byte-level kinds target blob fields such as BLE command sequences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    TypeSubstitution,
    BoundaryValue,
    OversizeValue,
    StructuralCorruption,
    DivideByZero,
    ObjectInjection,
    FlipChar,
    EmptyValue,
    SpecialNumber,
    PathologicalRepetition,
    BitFlip,
    ByteBoundary,
    TruncateBytes,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Unknown mutation kind '{0}'")]
pub struct UnknownMutationKind(pub String);

impl MutationKind {
    pub const ALL: [MutationKind; 13] = [
        MutationKind::TypeSubstitution,
        MutationKind::BoundaryValue,
        MutationKind::OversizeValue,
        MutationKind::StructuralCorruption,
        MutationKind::DivideByZero,
        MutationKind::ObjectInjection,
        MutationKind::FlipChar,
        MutationKind::EmptyValue,
        MutationKind::SpecialNumber,
        MutationKind::PathologicalRepetition,
        MutationKind::BitFlip,
        MutationKind::ByteBoundary,
        MutationKind::TruncateBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MutationKind::TypeSubstitution => "type-substitution",
            MutationKind::BoundaryValue => "boundary-value",
            MutationKind::OversizeValue => "oversize-value",
            MutationKind::StructuralCorruption => "structural-corruption",
            MutationKind::DivideByZero => "divide-by-zero",
            MutationKind::ObjectInjection => "object-injection",
            MutationKind::FlipChar => "flip-char",
            MutationKind::EmptyValue => "empty-value",
            MutationKind::SpecialNumber => "special-number",
            MutationKind::PathologicalRepetition => "pathological-repetition",
            MutationKind::BitFlip => "bit-flip",
            MutationKind::ByteBoundary => "byte-boundary",
            MutationKind::TruncateBytes => "truncate-bytes",
        }
    }

    /// Structural kinds are allowed to produce a payload that does not parse.
    pub fn is_structural(&self) -> bool {
        matches!(self, MutationKind::StructuralCorruption)
    }

    pub fn http_defaults() -> Vec<MutationKind> {
        vec![
            MutationKind::TypeSubstitution,
            MutationKind::BoundaryValue,
            MutationKind::OversizeValue,
            MutationKind::StructuralCorruption,
            MutationKind::DivideByZero,
            MutationKind::ObjectInjection,
            MutationKind::FlipChar,
            MutationKind::EmptyValue,
            MutationKind::SpecialNumber,
            MutationKind::PathologicalRepetition,
        ]
    }

    pub fn ble_defaults() -> Vec<MutationKind> {
        vec![
            MutationKind::BitFlip,
            MutationKind::ByteBoundary,
            MutationKind::TruncateBytes,
            MutationKind::TypeSubstitution,
            MutationKind::BoundaryValue,
            MutationKind::OversizeValue,
        ]
    }

    /// Picks one kind from `pool` with the caller's random source.
    pub fn choose<R: Rng + ?Sized>(pool: &[MutationKind], rng: &mut R) -> Option<MutationKind> {
        if pool.is_empty() {
            return None;
        }
        Some(pool[rng.random_range(0..pool.len())])
    }
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationKind {
    type Err = UnknownMutationKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        MutationKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownMutationKind(s.to_string()))
    }
}

/// The result of one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub kind: MutationKind,
    pub payload: Payload,
    /// The field the transform touched, or the best-effort field of a degraded mutation.
    pub field: Option<String>,
    /// Set when the kind was not applicable and the seed was passed through unchanged.
    pub degraded: bool,
}

/// A `Mutator` derives one new payload from a seed.
///
/// Implementations must be deterministic for a given random source state and must never fail
/// on a well-formed seed: an inapplicable kind degrades to an unchanged payload.
///
/// # Type Parameters
/// * `R`: The random number generator threaded through every call.
pub trait Mutator<R: Rng + ?Sized> {
    fn mutate(&self, seed: &Payload, kind: MutationKind, rng: &mut R) -> Mutation;
}

/// The payload mutation engine.
///
/// Holds only immutable tuning knobs; all randomness comes from the `rng` argument.
#[derive(Debug, Clone)]
pub struct PayloadMutator {
    pub divisor_field: String,
    pub corruption_field: String,
    pub oversize_digits: usize,
    pub oversize_blob_len: usize,
    pub repetition_len: usize,
}

impl Default for PayloadMutator {
    fn default() -> Self {
        Self {
            divisor_field: DEFAULT_DIVISOR_FIELD.to_string(),
            corruption_field: DEFAULT_CORRUPTION_FIELD.to_string(),
            oversize_digits: DEFAULT_OVERSIZE_DIGITS,
            oversize_blob_len: DEFAULT_OVERSIZE_BLOB_LEN,
            repetition_len: DEFAULT_REPETITION_LEN,
        }
    }
}

/// Mutates `seed` with the default engine settings and returns only the payload.
pub fn mutate<R: Rng + ?Sized>(seed: &Payload, kind: MutationKind, rng: &mut R) -> Payload {
    PayloadMutator::default().mutate(seed, kind, rng).payload
}

impl<R: Rng + ?Sized> Mutator<R> for PayloadMutator {
    fn mutate(&self, seed: &Payload, kind: MutationKind, rng: &mut R) -> Mutation {
        let mutation = match kind {
            MutationKind::TypeSubstitution => self.type_substitution(seed, rng),
            MutationKind::BoundaryValue => self.boundary_value(seed, rng),
            MutationKind::OversizeValue => self.oversize_value(seed, rng),
            MutationKind::StructuralCorruption => {
                let field = self.corruption_field.clone();
                Some(replaced(
                    kind,
                    seed,
                    field,
                    FieldValue::Raw(CORRUPTION_FRAGMENT.to_string()),
                ))
            }
            MutationKind::DivideByZero => {
                let field = self.divisor_field.clone();
                let zero = match seed.get(&field) {
                    Some(FieldValue::Text(_)) => FieldValue::text("0"),
                    _ => FieldValue::number(0),
                };
                Some(replaced(kind, seed, field, zero))
            }
            MutationKind::ObjectInjection => self.object_injection(seed, rng),
            MutationKind::FlipChar => self.flip_char(seed, rng),
            MutationKind::EmptyValue => pick_field(seed, rng, |_| true)
                .map(|field| replaced(kind, seed, field, FieldValue::text(""))),
            MutationKind::SpecialNumber => self.special_number(seed, rng),
            MutationKind::PathologicalRepetition => {
                pick_field(seed, rng, |v| matches!(v, FieldValue::Text(_))).map(|field| {
                    let mut value = "a".repeat(self.repetition_len);
                    value.push('b');
                    replaced(kind, seed, field, FieldValue::Text(value))
                })
            }
            MutationKind::BitFlip => self.with_blob(seed, rng, kind, 1, |bytes, rng| {
                let index = rng.random_range(0..bytes.len());
                let bit = 1u8 << rng.random_range(0..8u32);
                bytes[index] ^= bit;
            }),
            MutationKind::ByteBoundary => self.with_blob(seed, rng, kind, 1, |bytes, rng| {
                for byte in bytes.iter_mut() {
                    if rng.random_bool(BYTE_BOUNDARY_PROBABILITY) {
                        *byte = BYTE_BOUNDARY_VALUES[rng.random_range(0..BYTE_BOUNDARY_VALUES.len())];
                    }
                }
            }),
            MutationKind::TruncateBytes => self.with_blob(seed, rng, kind, 2, |bytes, rng| {
                let index = rng.random_range(0..bytes.len());
                bytes.remove(index);
            }),
        };

        match mutation {
            Some(mutation) => {
                log::debug!(
                    "{} applied to field {:?}",
                    kind,
                    mutation.field.as_deref().unwrap_or("-")
                );
                mutation
            }
            None => degraded(kind, seed),
        }
    }
}

impl PayloadMutator {
    fn type_substitution<R: Rng + ?Sized>(&self, seed: &Payload, rng: &mut R) -> Option<Mutation> {
        let kind = MutationKind::TypeSubstitution;
        let field = pick_field(seed, rng, |_| true)?;
        let original = seed.get(&field)?.clone();

        let substitute = match &original {
            FieldValue::Blob(bytes) if !bytes.is_empty() => {
                let mut items: Vec<JsonValue> = bytes.iter().map(|b| JsonValue::from(*b)).collect();
                let index = rng.random_range(0..items.len());
                items[index] = JsonValue::from("invalid");
                JsonValue::Array(items)
            }
            _ => {
                let candidates = [
                    JsonValue::Null,
                    json!([]),
                    json!({}),
                    JsonValue::Bool(true),
                    json!([1, 2, 3]),
                    json!({ "value": original.to_json() }),
                ];
                let chosen = candidates[rng.random_range(0..candidates.len())].clone();
                if FieldValue::Structured(chosen.clone()) == original {
                    json!({ "value": original.to_json() })
                } else {
                    chosen
                }
            }
        };
        Some(replaced(kind, seed, field, FieldValue::Structured(substitute)))
    }

    fn boundary_value<R: Rng + ?Sized>(&self, seed: &Payload, rng: &mut R) -> Option<Mutation> {
        let field = pick_field(seed, rng, FieldValue::is_numeric)?;
        let value = same_representation(seed.get(&field)?, BOUNDARY_VALUE.to_string());
        Some(replaced(MutationKind::BoundaryValue, seed, field, value))
    }

    fn oversize_value<R: Rng + ?Sized>(&self, seed: &Payload, rng: &mut R) -> Option<Mutation> {
        let field = pick_field(seed, rng, FieldValue::is_numeric)
            .or_else(|| pick_field(seed, rng, |_| true))?;
        let value = match seed.get(&field)? {
            FieldValue::Blob(_) => FieldValue::Blob(vec![0x41; self.oversize_blob_len]),
            original => {
                let mut digits = String::with_capacity(self.oversize_digits + 1);
                digits.push('1');
                digits.push_str(&"0".repeat(self.oversize_digits));
                same_representation(original, digits)
            }
        };
        Some(replaced(MutationKind::OversizeValue, seed, field, value))
    }

    fn object_injection<R: Rng + ?Sized>(&self, seed: &Payload, rng: &mut R) -> Option<Mutation> {
        let field = pick_field(seed, rng, |_| true)
            .unwrap_or_else(|| INJECTION_FALLBACK_FIELD.to_string());
        let gadgets = [
            json!({ "py/object": "builtins.type", "py/state": { "__name__": "Injected" } }),
            json!({ "__class__": { "__init__": { "__globals__": {} } } }),
            json!({
                "$type": "System.Windows.Data.ObjectDataProvider, PresentationFramework",
                "MethodName": "Start"
            }),
            json!({
                "@type": "com.sun.rowset.JdbcRowSetImpl",
                "dataSourceName": "ldap://127.0.0.1:1389/Injected",
                "autoCommit": true
            }),
            json!({ "__proto__": { "isAdmin": true } }),
        ];
        let gadget = gadgets[rng.random_range(0..gadgets.len())].clone();
        Some(replaced(
            MutationKind::ObjectInjection,
            seed,
            field,
            FieldValue::Structured(gadget),
        ))
    }

    fn flip_char<R: Rng + ?Sized>(&self, seed: &Payload, rng: &mut R) -> Option<Mutation> {
        let field = pick_field(
            seed,
            rng,
            |v| matches!(v, FieldValue::Text(s) if !s.is_empty()),
        )?;
        let FieldValue::Text(original) = seed.get(&field)? else {
            return None;
        };
        let mut chars: Vec<char> = original.chars().collect();
        let index = rng.random_range(0..chars.len());
        chars[index] = FLIP_CHARS[rng.random_range(0..FLIP_CHARS.len())] as char;
        Some(replaced(
            MutationKind::FlipChar,
            seed,
            field,
            FieldValue::Text(chars.into_iter().collect()),
        ))
    }

    fn special_number<R: Rng + ?Sized>(&self, seed: &Payload, rng: &mut R) -> Option<Mutation> {
        let field = pick_field(seed, rng, FieldValue::is_numeric)?;
        let special = SPECIAL_NUMBERS[rng.random_range(0..SPECIAL_NUMBERS.len())];
        let value = match seed.get(&field)? {
            FieldValue::Number(_) if serde_json::from_str::<serde_json::Number>(special).is_ok() => {
                FieldValue::number(special)
            }
            _ => FieldValue::text(special),
        };
        Some(replaced(MutationKind::SpecialNumber, seed, field, value))
    }

    /// Applies `edit` to a copy of a random blob field holding at least `min_len` bytes.
    fn with_blob<R, F>(
        &self,
        seed: &Payload,
        rng: &mut R,
        kind: MutationKind,
        min_len: usize,
        edit: F,
    ) -> Option<Mutation>
    where
        R: Rng + ?Sized,
        F: FnOnce(&mut Vec<u8>, &mut R),
    {
        let field = pick_field(
            seed,
            rng,
            |v| matches!(v, FieldValue::Blob(bytes) if bytes.len() >= min_len),
        )?;
        let FieldValue::Blob(original) = seed.get(&field)? else {
            return None;
        };
        let mut bytes = original.clone();
        edit(&mut bytes, rng);
        Some(replaced(kind, seed, field, FieldValue::Blob(bytes)))
    }
}

fn pick_field<R, P>(seed: &Payload, rng: &mut R, predicate: P) -> Option<String>
where
    R: Rng + ?Sized,
    P: Fn(&FieldValue) -> bool,
{
    let candidates: Vec<&str> = seed
        .fields()
        .filter(|(_, value)| predicate(value))
        .map(|(name, _)| name)
        .collect();
    if candidates.is_empty() {
        return None;
    }
    Some(candidates[rng.random_range(0..candidates.len())].to_string())
}

/// Keeps numbers as numbers and everything else as text.
fn same_representation(original: &FieldValue, literal: String) -> FieldValue {
    match original {
        FieldValue::Number(_) => FieldValue::Number(literal),
        _ => FieldValue::Text(literal),
    }
}

fn replaced(kind: MutationKind, seed: &Payload, field: String, value: FieldValue) -> Mutation {
    let mut payload = seed.clone();
    payload.set(field.clone(), value);
    Mutation {
        kind,
        payload,
        field: Some(field),
        degraded: false,
    }
}

fn degraded(kind: MutationKind, seed: &Payload) -> Mutation {
    let field = seed.field_names().first().map(|name| name.to_string());
    log::warn!(
        "{} is not applicable to seed {}; passing it through unchanged on field {:?}",
        kind,
        seed,
        field.as_deref().unwrap_or("-")
    );
    Mutation {
        kind,
        payload: seed.clone(),
        field,
        degraded: true,
    }
}
