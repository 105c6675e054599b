// Global constants of the ring. Tunables that differ per deployment live in
// `config`; the values here are the defaults and the hard limits.

// sha1 digest width, so the id space is [0, 2^160)
pub const ID_SPACE_BITS : u32 = 160;

// log2(160) ~ 7
pub const MAX_SUCCESSORS : usize = 7;

// retry policy of a single RPC
pub const RPC_RETRY_CNT_LIMIT : u32 = 5;
pub const RPC_RETRY_BASE_DELAY_MILLIS : u64 = 100;
pub const RPC_TIMEOUT_MILLIS : u64 = 2000;

// a ping is a bare connect and must answer quickly
pub const PING_TIMEOUT_MILLIS : u64 = 500;

// maintenance loop intervals
pub const STABILIZE_INTERVAL_MILLIS : u64 = 2000;
pub const FIX_FINGERS_INTERVAL_MILLIS : u64 = 1000;
pub const UPDATE_SUCCESSORS_INTERVAL_MILLIS : u64 = 1000;

// how many times a maintenance cycle is retried on transport failure before
// the cycle is skipped
pub const MAINTENANCE_CYCLE_RETRY_CNT : u32 = 3;

// a refused join handoff is retried once per stabilize interval, the ring
// usually settles within a few cycles
pub const JOIN_RETRY_CNT_LIMIT : u32 = 30;

// background loops sleep in slices of this length so that shutdown is noticed
pub const SLEEP_SLICE_MILLIS : u64 = 20;

// upper bound of forwarding put/get/enqueue/dequeue between nodes
pub const MAX_FORWARD_HOPS : u8 = 32;

// upper bound of iterations of find_predecessor
pub const MAX_LOOKUP_HOPS : usize = 128;

// 16MiB, anything larger is treated as garbage
pub const MAX_FRAME_LEN : usize = 16 * 1024 * 1024;
