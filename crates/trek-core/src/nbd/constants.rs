//! NBD wire protocol constants.
//!
//! From the NetworkBlockDevice protocol document (fixed newstyle negotiation).

pub const NBD_DEFAULT_PORT: u16 = 10809;

// ============================================================================
// Magics
// ============================================================================

/// 'NBDMAGIC'
pub const NBD_MAGIC: u64 = 0x4E42_444D_4147_4943;
/// 'IHAVEOPT'
pub const NBD_OPTS_MAGIC: u64 = 0x4948_4156_454F_5054;
pub const NBD_REP_MAGIC: u64 = 0x0003_E889_0455_65A9;
pub const NBD_REQUEST_MAGIC: u32 = 0x2560_9513;
pub const NBD_SIMPLE_REPLY_MAGIC: u32 = 0x6744_6698;
pub const NBD_STRUCTURED_REPLY_MAGIC: u32 = 0x668E_33EF;

// ============================================================================
// Handshake Flags
// ============================================================================

pub const NBD_FLAG_FIXED_NEWSTYLE: u16 = 1 << 0;
pub const NBD_FLAG_NO_ZEROES: u16 = 1 << 1;

pub const NBD_FLAG_C_FIXED_NEWSTYLE: u32 = 1 << 0;
pub const NBD_FLAG_C_NO_ZEROES: u32 = 1 << 1;

// ============================================================================
// Transmission Flags
// ============================================================================

pub const NBD_FLAG_HAS_FLAGS: u16 = 1 << 0;
pub const NBD_FLAG_READ_ONLY: u16 = 1 << 1;
pub const NBD_FLAG_SEND_FLUSH: u16 = 1 << 2;

// ============================================================================
// Options
// ============================================================================

pub const NBD_OPT_EXPORT_NAME: u32 = 1;
pub const NBD_OPT_ABORT: u32 = 2;
pub const NBD_OPT_LIST: u32 = 3;
pub const NBD_OPT_INFO: u32 = 6;
pub const NBD_OPT_GO: u32 = 7;
pub const NBD_OPT_STRUCTURED_REPLY: u32 = 8;

// ============================================================================
// Option Replies
// ============================================================================

pub const NBD_REP_ACK: u32 = 1;
pub const NBD_REP_SERVER: u32 = 2;
pub const NBD_REP_INFO: u32 = 3;

const NBD_REP_FLAG_ERROR: u32 = 1 << 31;
pub const NBD_REP_ERR_UNSUP: u32 = NBD_REP_FLAG_ERROR | 1;
pub const NBD_REP_ERR_INVALID: u32 = NBD_REP_FLAG_ERROR | 3;
pub const NBD_REP_ERR_UNKNOWN: u32 = NBD_REP_FLAG_ERROR | 6;

pub const NBD_INFO_EXPORT: u16 = 0;
pub const NBD_INFO_NAME: u16 = 1;
pub const NBD_INFO_DESCRIPTION: u16 = 2;
pub const NBD_INFO_BLOCK_SIZE: u16 = 3;

// ============================================================================
// Commands
// ============================================================================

pub const NBD_CMD_READ: u16 = 0;
pub const NBD_CMD_WRITE: u16 = 1;
pub const NBD_CMD_DISC: u16 = 2;
pub const NBD_CMD_FLUSH: u16 = 3;

// ============================================================================
// Structured Replies
// ============================================================================

pub const NBD_REPLY_FLAG_DONE: u16 = 1 << 0;
pub const NBD_REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const NBD_REPLY_TYPE_ERROR: u16 = (1 << 15) | 1;

// ============================================================================
// Error Codes
// ============================================================================

pub const NBD_EPERM: u32 = 1;
pub const NBD_EIO: u32 = 5;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ESHUTDOWN: u32 = 108;

// ============================================================================
// Limits
// ============================================================================

/// Export block sizes: minimum / preferred / maximum.
pub const MIN_BLOCK_SIZE: u32 = 512;
pub const PREFERRED_BLOCK_SIZE: u32 = 16_384;
pub const MAX_BLOCK_SIZE: u32 = 16_384;

/// Largest request payload the server will buffer.
pub const MAX_REQUEST_BYTES: u32 = 32 * 1024 * 1024;

/// Largest option payload accepted during negotiation.
pub const MAX_OPTION_BYTES: u32 = 64 * 1024;

/// Request header: magic(4) flags(2) type(2) cookie(8) offset(8) length(4).
pub const REQUEST_HEADER_LEN: usize = 28;
