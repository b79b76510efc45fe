//! Branded identifiers and time-ordered event ids.
//!
//! Aggregate ids are opaque strings minted server-side (`v4` UUIDs with a
//! short prefix) or provided by upstream systems. Event ids are UUIDv7 so the
//! leading bits encode generation time and lexical order tracks temporal
//! order; the generator keeps a per-process counter so two ids minted in the
//! same millisecond still compare in generation order.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// A grant award (one per funding cycle).
    GrantId
);
string_id!(
    /// A bounded funding period.
    CycleId
);
string_id!(VoucherId);
string_id!(ClinicId);
string_id!(ClaimId);
string_id!(InvoiceId);
string_id!(
    /// An OASIS export batch.
    BatchId
);
string_id!(
    /// A breeder compliance filing.
    FilingId
);
string_id!(ActorId);
string_id!(CorrelationId);

impl ClaimId {
    /// Mint a fresh claim id in the durable `clm_` format.
    pub fn mint() -> Self {
        Self(format!("clm_{}", Uuid::new_v4().simple()))
    }

    /// Client-supplied claim ids must already be in the minted format.
    pub fn is_well_formed(&self) -> bool {
        self.0.strip_prefix("clm_").is_some_and(|rest| {
            rest.len() == 32 && rest.bytes().all(|b| b.is_ascii_hexdigit())
        })
    }
}

impl VoucherId {
    pub fn mint() -> Self {
        Self(format!("vch_{}", Uuid::new_v4().simple()))
    }
}

impl InvoiceId {
    pub fn mint() -> Self {
        Self(format!("inv_{}", Uuid::new_v4().simple()))
    }
}

impl BatchId {
    pub fn mint() -> Self {
        Self(format!("bat_{}", Uuid::new_v4().simple()))
    }
}

/// Who performed an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorKind {
    Applicant,
    Admin,
    System,
}

impl ActorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Applicant => "APPLICANT",
            Self::Admin => "ADMIN",
            Self::System => "SYSTEM",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPLICANT" => Some(Self::Applicant),
            "ADMIN" => Some(Self::Admin),
            "SYSTEM" => Some(Self::System),
            _ => None,
        }
    }
}

/// Time-ordered event identifier (UUIDv7).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Append requires the time-ordered format.
    pub fn is_time_ordered(&self) -> bool {
        self.0.get_version_num() == 7
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }

    /// Milliseconds since the Unix epoch encoded in the high 48 bits.
    pub fn timestamp_ms(&self) -> i64 {
        let b = self.0.as_bytes();
        ((b[0] as i64) << 40)
            | ((b[1] as i64) << 32)
            | ((b[2] as i64) << 24)
            | ((b[3] as i64) << 16)
            | ((b[4] as i64) << 8)
            | (b[5] as i64)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic UUIDv7 generator.
///
/// Layout: 48-bit unix millis, version nibble, 12-bit sequence, variant bits,
/// 62 random bits. The sequence resets each millisecond and increments for
/// ids minted inside the same millisecond, so `(timestamp, id)` comparisons
/// agree with generation order within one process. Sequence exhaustion rolls
/// the timestamp forward one millisecond.
#[derive(Debug, Default)]
pub struct EventIdGen {
    state: Mutex<GenState>,
}

#[derive(Debug, Default)]
struct GenState {
    last_ms: u64,
    seq: u16,
}

impl EventIdGen {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mint the next id for the given wall-clock millisecond.
    pub fn next(&self, now_ms: i64) -> EventId {
        let now_ms = now_ms.max(0) as u64;
        let mut state = self.state.lock();
        if now_ms > state.last_ms {
            state.last_ms = now_ms;
            state.seq = 0;
        } else {
            state.seq += 1;
            if state.seq > 0x0FFF {
                state.last_ms += 1;
                state.seq = 0;
            }
        }
        let ms = state.last_ms;
        let seq = state.seq;
        drop(state);

        let rand_b: u64 = rand::random::<u64>() & 0x3FFF_FFFF_FFFF_FFFF;
        let mut bytes = [0u8; 16];
        bytes[0] = (ms >> 40) as u8;
        bytes[1] = (ms >> 32) as u8;
        bytes[2] = (ms >> 24) as u8;
        bytes[3] = (ms >> 16) as u8;
        bytes[4] = (ms >> 8) as u8;
        bytes[5] = ms as u8;
        bytes[6] = 0x70 | ((seq >> 8) as u8 & 0x0F);
        bytes[7] = seq as u8;
        bytes[8] = 0x80 | ((rand_b >> 56) as u8 & 0x3F);
        bytes[9] = (rand_b >> 48) as u8;
        bytes[10] = (rand_b >> 40) as u8;
        bytes[11] = (rand_b >> 32) as u8;
        bytes[12] = (rand_b >> 24) as u8;
        bytes[13] = (rand_b >> 16) as u8;
        bytes[14] = (rand_b >> 8) as u8;
        bytes[15] = rand_b as u8;
        EventId(Uuid::from_bytes(bytes))
    }

    /// Mint using the system clock.
    pub fn next_now(&self) -> EventId {
        self.next(chrono::Utc::now().timestamp_millis())
    }
}

/// Hex-encoded SHA-256 of the input bytes.
pub fn sha256_hex(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_v7_and_monotonic() {
        let gen = EventIdGen::new();
        let mut prev = gen.next(1_700_000_000_000);
        assert!(prev.is_time_ordered());
        for _ in 0..5000 {
            let next = gen.next(1_700_000_000_000);
            assert!(next.is_time_ordered());
            assert!(next > prev, "ids in one millisecond must stay ordered");
            prev = next;
        }
    }

    #[test]
    fn timestamp_round_trips_through_id() {
        let gen = EventIdGen::new();
        let id = gen.next(1_700_000_123_456);
        assert_eq!(id.timestamp_ms(), 1_700_000_123_456);
    }

    #[test]
    fn clock_regression_does_not_reorder() {
        let gen = EventIdGen::new();
        let a = gen.next(2_000);
        let b = gen.next(1_000); // clock went backwards
        assert!(b > a);
    }

    #[test]
    fn v4_is_not_time_ordered() {
        let id = EventId::from_uuid(Uuid::new_v4());
        assert!(!id.is_time_ordered());
    }

    #[test]
    fn minted_claim_ids_are_well_formed() {
        let id = ClaimId::mint();
        assert!(id.is_well_formed());
        assert!(!ClaimId::new("claim-1").is_well_formed());
    }

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
