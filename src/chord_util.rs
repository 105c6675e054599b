use std::fmt;

use lazy_static::lazy_static;
use num_bigint::BigUint;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;

use crate::gval;

lazy_static! {
    // 0を含めての数である点に注意. ids are reduced modulo this value
    static ref ID_SPACE_RANGE : BigUint = BigUint::from(1u32) << gval::ID_SPACE_BITS;
}

/// A point of the circular identifier space `[0, 2^160)`.
///
/// Node ids and key ids share this space. Arithmetic always wraps around the
/// ring. On the wire an id travels as a 40 digit lower-case hex string.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ChordId(BigUint);

impl ChordId {
    pub fn new(val: BigUint) -> ChordId {
        ChordId(val % &*ID_SPACE_RANGE)
    }

    pub fn from_u64(val: u64) -> ChordId {
        ChordId::new(BigUint::from(val))
    }

    /// sha1 of an arbitrary string, e.g. `"10.0.0.1:8000"` or a client name.
    pub fn hash_of(input_str: &str) -> ChordId {
        let digest = Sha1::digest(input_str.as_bytes());
        ChordId::new(BigUint::from_bytes_be(&digest))
    }

    pub fn add(&self, offset: &BigUint) -> ChordId {
        ChordId::new(&self.0 + offset)
    }

    /// `self + 2^exp`, the start of finger `exp`.
    pub fn plus_pow2(&self, exp: u32) -> ChordId {
        self.add(&(BigUint::from(1u32) << exp))
    }

    pub fn next(&self) -> ChordId {
        self.add(&BigUint::from(1u32))
    }

    pub fn to_hex(&self) -> String {
        format!("{:040x}", self.0)
    }
}

impl fmt::Display for ChordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "{}..({}%)", &hex[..10], conv_id_to_ratio_str(self))
    }
}

impl fmt::Debug for ChordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChordId({})", self.to_hex())
    }
}

impl From<ChordId> for String {
    fn from(id: ChordId) -> String {
        id.to_hex()
    }
}

impl TryFrom<String> for ChordId {
    type Error = String;

    fn try_from(hex: String) -> Result<Self, Self::Error> {
        if hex.is_empty() || hex.len() > 40 {
            return Err(format!("id must be 1 to 40 hex digits, got {:?}", hex));
        }
        match BigUint::parse_bytes(hex.as_bytes(), 16) {
            Some(val) => Ok(ChordId::new(val)),
            None => Err(format!("id is not hex: {:?}", hex)),
        }
    }
}

// True iff c is in the circular half-open interval [a, b).
// a == b is the empty interval. Every responsibility and finger decision goes
// through this function.
pub fn between(c: &ChordId, a: &ChordId, b: &ChordId) -> bool {
    if a < b {
        a <= c && c < b
    } else if a > b {
        a <= c || c < b
    } else {
        false
    }
}

// c in (a, b]. used for "is a responsible for c"
pub fn exist_between_right_closed(c: &ChordId, a: &ChordId, b: &ChordId) -> bool {
    between(c, &a.next(), &b.next())
}

// c in (a, b). for a == b this is every id except a
pub fn exist_between_open(c: &ChordId, a: &ChordId, b: &ChordId) -> bool {
    between(c, &a.next(), b)
}

// ID空間が環状になっていることを踏まえて base_id から後方(IDが大きくなる方向)
// にたどった場合の距離
pub fn calc_distance_right_mawari(base_id: &ChordId, target_id: &ChordId) -> BigUint {
    if target_id.0 >= base_id.0 {
        &target_id.0 - &base_id.0
    } else {
        &*ID_SPACE_RANGE - &base_id.0 + &target_id.0
    }
}

// idがID空間の最大値に対して何パーセントの位置か. only for logging
pub fn conv_id_to_ratio_str(id: &ChordId) -> String {
    let top_bits = (&id.0 >> (gval::ID_SPACE_BITS - 32))
        .to_u32_digits()
        .first()
        .copied()
        .unwrap_or(0);
    let ratio = (top_bits as f64 / u32::MAX as f64) * 100.0;
    format!("{:.4}", ratio)
}

// ログのタイムスタンプ. ローカル時刻をそのまま出す
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().naive_local())
    }
}

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides `level`.
/// Calling it again is a no-op.
pub fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTimer)
        .with_thread_names(true)
        .try_init();
}

// 0からlimitより1少ない数までの値の乱数を返す
pub fn get_rnd_int_with_limit(limit: u32) -> u32 {
    let mut rng = rand::thread_rng();
    rng.gen_range(0..limit)
}

#[derive(Debug, thiserror::Error)]
pub enum GeneralError {
    /// Transport failure that survived the retry policy.
    #[error("peer {addr} unreachable after {attempts} attempt(s): {reason}")]
    PeerUnreachable {
        addr: String,
        attempts: u32,
        reason: String,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The peer handled the request but reported a failure.
    #[error("peer {addr} failed the request: {message}")]
    Remote { addr: String, message: String },

    #[error("request was forwarded more than {0} times")]
    ForwardLimitExceeded(u8),

    #[error("peer {addr} sent an unexpected response to {command}")]
    UnexpectedResponse { addr: String, command: &'static str },

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("callback failed: {0}")]
    Callback(String),

    #[error("directory service unavailable: {0}")]
    DirectoryUnavailable(String),
}

impl GeneralError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, GeneralError::PeerUnreachable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> ChordId {
        ChordId::from_u64(v)
    }

    fn top() -> ChordId {
        ChordId::new(&*ID_SPACE_RANGE - 1u32)
    }

    #[test]
    fn between_plain_interval() {
        assert!(between(&id(10), &id(10), &id(20)));
        assert!(between(&id(15), &id(10), &id(20)));
        assert!(!between(&id(20), &id(10), &id(20)));
        assert!(!between(&id(5), &id(10), &id(20)));
        assert!(!between(&id(25), &id(10), &id(20)));
    }

    #[test]
    fn between_wraps_through_zero() {
        let a = top();
        assert!(between(&a, &a, &id(5)));
        assert!(between(&id(0), &a, &id(5)));
        assert!(between(&id(4), &a, &id(5)));
        assert!(!between(&id(5), &a, &id(5)));
        assert!(!between(&id(100), &a, &id(5)));
    }

    #[test]
    fn single_point_interval_is_empty() {
        for c in [0u64, 1, 7, 1 << 40] {
            assert!(!between(&id(c), &id(7), &id(7)));
        }
        assert!(!between(&top(), &top(), &top()));
    }

    #[test]
    fn right_closed_interval_includes_end() {
        assert!(exist_between_right_closed(&id(20), &id(10), &id(20)));
        assert!(!exist_between_right_closed(&id(10), &id(10), &id(20)));
        // wrap: (top, 3]
        assert!(exist_between_right_closed(&id(0), &top(), &id(3)));
        assert!(exist_between_right_closed(&id(3), &top(), &id(3)));
        assert!(!exist_between_right_closed(&top(), &top(), &id(3)));
        // end at the top of the id space
        assert!(exist_between_right_closed(&top(), &id(10), &top()));
    }

    #[test]
    fn open_interval_over_same_point_is_everything_else() {
        assert!(exist_between_open(&id(3), &id(9), &id(9)));
        assert!(exist_between_open(&top(), &id(9), &id(9)));
        assert!(!exist_between_open(&id(9), &id(9), &id(9)));
        assert!(!exist_between_open(&id(20), &id(10), &id(20)));
        assert!(exist_between_open(&id(19), &id(10), &id(20)));
    }

    #[test]
    fn finger_start_wraps_around() {
        let near_top = ChordId::new(&*ID_SPACE_RANGE - 2u32);
        assert_eq!(near_top.plus_pow2(2), id(2));
        assert_eq!(id(1).plus_pow2(0), id(2));
        assert_eq!(top().next(), id(0));
    }

    #[test]
    fn distance_is_measured_clockwise() {
        assert_eq!(calc_distance_right_mawari(&id(10), &id(15)), BigUint::from(5u32));
        assert_eq!(calc_distance_right_mawari(&top(), &id(1)), BigUint::from(2u32));
        assert_eq!(calc_distance_right_mawari(&id(3), &id(3)), BigUint::from(0u32));
    }

    #[test]
    fn hash_is_sha1_of_address() {
        let node_id = ChordId::hash_of("127.0.0.1:5000");
        assert_eq!(node_id, ChordId::hash_of("127.0.0.1:5000"));
        assert_ne!(node_id, ChordId::hash_of("127.0.0.1:5001"));
        // sha1("abc")
        assert_eq!(
            ChordId::hash_of("abc").to_hex(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn id_travels_as_hex_string() {
        let key = ChordId::hash_of("alice");
        let encoded = serde_json::to_string(&key).unwrap();
        assert_eq!(encoded, format!("\"{}\"", key.to_hex()));
        let decoded: ChordId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, key);
        assert!(serde_json::from_str::<ChordId>("\"not-hex\"").is_err());
    }

    #[test]
    fn ratio_string_marks_position_on_ring() {
        assert_eq!(conv_id_to_ratio_str(&id(0)), "0.0000");
        assert_eq!(conv_id_to_ratio_str(&top()), "100.0000");
    }
}
