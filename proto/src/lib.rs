// SPDX-License-Identifier: MIT
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use bitflags::bitflags;
use strum_macros::FromRepr;

pub mod codec;

/// `TPM_ST` values that appear in command and response headers.
///
/// The possible values for `TPM_ST` are described in the section 6.9 of
/// the TPM 2.0 Structures specification. Only the tags that frame
/// commands and responses are of interest to the broker.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Tag {
    /// `TPM_ST_RSP_COMMAND`: error response to a badly framed command
    RspCommand = 0x00C4,
    /// `TPM_ST_NULL`
    Null = 0x8000,
    /// `TPM_ST_NO_SESSIONS`
    NoSessions = 0x8001,
    /// `TPM_ST_SESSIONS`
    Sessions = 0x8002,
}

/// `TPM_CC_FIRST`
pub const CC_FIRST: u32 = 0x0000_011F;

/// `TPM_CC_LAST`
pub const CC_LAST: u32 = 0x0000_0193;

/// Enumeration of the `TPM_CC` values the broker inspects by name.
///
/// The possible values for `TPM_CC` are described in the section 6.5.2 of
/// the TPM 2.0 Structures specification. Client commands are dispatched
/// by their raw 32 bit code; this enumeration covers the codes the broker
/// itself issues or special-cases, plus the codes used when building
/// traffic in tests.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Command {
    /// `TPM_CC_EvictControl`
    EvictControl = 0x0000_0120,
    /// `TPM_CC_HierarchyControl`
    HierarchyControl = 0x0000_0121,
    /// `TPM_CC_Clear`
    Clear = 0x0000_0126,
    /// `TPM_CC_ClearControl`
    ClearControl = 0x0000_0127,
    /// `TPM_CC_HierarchyChangeAuth`
    HierarchyChangeAuth = 0x0000_0129,
    /// `TPM_CC_NV_DefineSpace`
    NvDefineSpace = 0x0000_0130,
    /// `TPM_CC_CreatePrimary`
    CreatePrimary = 0x0000_0131,
    /// `TPM_CC_DictionaryAttackLockReset`
    DictionaryAttackLockReset = 0x0000_0139,
    /// `TPM_CC_SequenceComplete`
    SequenceComplete = 0x0000_013E,
    /// `TPM_CC_IncrementalSelfTest`
    IncrementalSelfTest = 0x0000_0142,
    /// `TPM_CC_SelfTest`
    SelfTest = 0x0000_0143,
    /// `TPM_CC_Startup`
    Startup = 0x0000_0144,
    /// `TPM_CC_Shutdown`
    Shutdown = 0x0000_0145,
    /// `TPM_CC_StirRandom`
    StirRandom = 0x0000_0146,
    /// `TPM_CC_ActivateCredential`
    ActivateCredential = 0x0000_0147,
    /// `TPM_CC_Certify`
    Certify = 0x0000_0148,
    /// `TPM_CC_NV_Read`
    NvRead = 0x0000_014E,
    /// `TPM_CC_ObjectChangeAuth`
    ObjectChangeAuth = 0x0000_0150,
    /// `TPM_CC_PolicySecret`
    PolicySecret = 0x0000_0151,
    /// `TPM_CC_Create`
    Create = 0x0000_0153,
    /// `TPM_CC_HMAC`
    Hmac = 0x0000_0155,
    /// `TPM_CC_Import`
    Import = 0x0000_0156,
    /// `TPM_CC_Load`
    Load = 0x0000_0157,
    /// `TPM_CC_Quote`
    Quote = 0x0000_0158,
    /// `TPM_CC_HMAC_Start`
    HmacStart = 0x0000_015B,
    /// `TPM_CC_SequenceUpdate`
    SequenceUpdate = 0x0000_015C,
    /// `TPM_CC_Sign`
    Sign = 0x0000_015D,
    /// `TPM_CC_Unseal`
    Unseal = 0x0000_015E,
    /// `TPM_CC_PolicySigned`
    PolicySigned = 0x0000_0160,
    /// `TPM_CC_ContextLoad`
    ContextLoad = 0x0000_0161,
    /// `TPM_CC_ContextSave`
    ContextSave = 0x0000_0162,
    /// `TPM_CC_EncryptDecrypt`
    EncryptDecrypt = 0x0000_0164,
    /// `TPM_CC_FlushContext`
    FlushContext = 0x0000_0165,
    /// `TPM_CC_LoadExternal`
    LoadExternal = 0x0000_0167,
    /// `TPM_CC_MakeCredential`
    MakeCredential = 0x0000_0168,
    /// `TPM_CC_NV_ReadPublic`
    NvReadPublic = 0x0000_0169,
    /// `TPM_CC_PolicyAuthValue`
    PolicyAuthValue = 0x0000_016B,
    /// `TPM_CC_PolicyCommandCode`
    PolicyCommandCode = 0x0000_016C,
    /// `TPM_CC_PolicyOR`
    PolicyOR = 0x0000_0171,
    /// `TPM_CC_ReadPublic`
    ReadPublic = 0x0000_0173,
    /// `TPM_CC_StartAuthSession`
    StartAuthSession = 0x0000_0176,
    /// `TPM_CC_VerifySignature`
    VerifySignature = 0x0000_0177,
    /// `TPM_CC_ECC_Parameters`
    EccParameters = 0x0000_0178,
    /// `TPM_CC_GetCapability`
    GetCapability = 0x0000_017A,
    /// `TPM_CC_GetRandom`
    GetRandom = 0x0000_017B,
    /// `TPM_CC_GetTestResult`
    GetTestResult = 0x0000_017C,
    /// `TPM_CC_Hash`
    Hash = 0x0000_017D,
    /// `TPM_CC_PCR_Read`
    PcrRead = 0x0000_017E,
    /// `TPM_CC_PolicyPCR`
    PolicyPcr = 0x0000_017F,
    /// `TPM_CC_PolicyRestart`
    PolicyRestart = 0x0000_0180,
    /// `TPM_CC_ReadClock`
    ReadClock = 0x0000_0181,
    /// `TPM_CC_PCR_Extend`
    PcrExtend = 0x0000_0182,
    /// `TPM_CC_PolicyGetDigest`
    PolicyGetDigest = 0x0000_0189,
    /// `TPM_CC_TestParms`
    TestParms = 0x0000_018A,
    /// `TPM_CC_CreateLoaded`
    CreateLoaded = 0x0000_0191,
}

pub const RC_VER1: u32 = 0x0100;
pub const RC_FMT1: u32 = 0x0080;
pub const RC_WARN: u32 = 0x0900;

/// Enumeration of the `TPM_RC` values.
///
/// The possible values for `TPM_RC` are described in the section 6.6 of the
/// TPM 2.0 Structures specification. The display form is the `TPM_RC_*`
/// name from the specification.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[repr(u32)]
pub enum ResponseCode {
    #[strum(serialize = "TPM_RC_SUCCESS")]
    Success = 0x0000,
    #[strum(serialize = "TPM_RC_BAD_TAG")]
    BadTag = 0x001E,
    #[strum(serialize = "TPM_RC_INITIALIZE")]
    Initialize = RC_VER1,
    #[strum(serialize = "TPM_RC_FAILURE")]
    Failure = RC_VER1 + 0x001,
    #[strum(serialize = "TPM_RC_SEQUENCE")]
    Sequence = RC_VER1 + 0x003,
    #[strum(serialize = "TPM_RC_PRIVATE")]
    Private = RC_VER1 + 0x00B,
    #[strum(serialize = "TPM_RC_HMAC")]
    Hmac = RC_VER1 + 0x019,
    #[strum(serialize = "TPM_RC_DISABLED")]
    Disabled = RC_VER1 + 0x020,
    #[strum(serialize = "TPM_RC_EXCLUSIVE")]
    Exclusive = RC_VER1 + 0x021,
    #[strum(serialize = "TPM_RC_AUTH_TYPE")]
    AuthType = RC_VER1 + 0x024,
    #[strum(serialize = "TPM_RC_AUTH_MISSING")]
    AuthMissing = RC_VER1 + 0x025,
    #[strum(serialize = "TPM_RC_POLICY")]
    Policy = RC_VER1 + 0x026,
    #[strum(serialize = "TPM_RC_PCR")]
    Pcr = RC_VER1 + 0x027,
    #[strum(serialize = "TPM_RC_PCR_CHANGED")]
    PcrChanged = RC_VER1 + 0x028,
    #[strum(serialize = "TPM_RC_UPGRADE")]
    Upgrade = RC_VER1 + 0x02D,
    #[strum(serialize = "TPM_RC_TOO_MANY_CONTEXTS")]
    TooManyContexts = RC_VER1 + 0x02E,
    #[strum(serialize = "TPM_RC_AUTH_UNAVAILABLE")]
    AuthUnavailable = RC_VER1 + 0x02F,
    #[strum(serialize = "TPM_RC_REBOOT")]
    Reboot = RC_VER1 + 0x030,
    #[strum(serialize = "TPM_RC_UNBALANCED")]
    Unbalanced = RC_VER1 + 0x031,
    #[strum(serialize = "TPM_RC_COMMAND_SIZE")]
    CommandSize = RC_VER1 + 0x042,
    #[strum(serialize = "TPM_RC_COMMAND_CODE")]
    CommandCode = RC_VER1 + 0x043,
    #[strum(serialize = "TPM_RC_AUTHSIZE")]
    AuthSize = RC_VER1 + 0x044,
    #[strum(serialize = "TPM_RC_AUTH_CONTEXT")]
    AuthContext = RC_VER1 + 0x045,
    #[strum(serialize = "TPM_RC_NV_RANGE")]
    NvRange = RC_VER1 + 0x046,
    #[strum(serialize = "TPM_RC_NV_SIZE")]
    NvSize = RC_VER1 + 0x047,
    #[strum(serialize = "TPM_RC_NV_LOCKED")]
    NvLocked = RC_VER1 + 0x048,
    #[strum(serialize = "TPM_RC_NV_AUTHORIZATION")]
    NvAuthorization = RC_VER1 + 0x049,
    #[strum(serialize = "TPM_RC_NV_UNINITIALIZED")]
    NvUninitialized = RC_VER1 + 0x04A,
    #[strum(serialize = "TPM_RC_NV_SPACE")]
    NvSpace = RC_VER1 + 0x04B,
    #[strum(serialize = "TPM_RC_NV_DEFINED")]
    NvDefined = RC_VER1 + 0x04C,
    #[strum(serialize = "TPM_RC_BAD_CONTEXT")]
    BadContext = RC_VER1 + 0x050,
    #[strum(serialize = "TPM_RC_CPHASH")]
    CpHash = RC_VER1 + 0x051,
    #[strum(serialize = "TPM_RC_PARENT")]
    Parent = RC_VER1 + 0x052,
    #[strum(serialize = "TPM_RC_NEEDS_TEST")]
    NeedsTest = RC_VER1 + 0x053,
    #[strum(serialize = "TPM_RC_NO_RESULT")]
    NoResult = RC_VER1 + 0x054,
    #[strum(serialize = "TPM_RC_SENSITIVE")]
    Sensitive = RC_VER1 + 0x055,
    #[strum(serialize = "TPM_RC_ASYMMETRIC")]
    Asymmetric = RC_FMT1 + 0x001,
    #[strum(serialize = "TPM_RC_ATTRIBUTES")]
    Attributes = RC_FMT1 + 0x002,
    #[strum(serialize = "TPM_RC_HASH")]
    Hash = RC_FMT1 + 0x003,
    #[strum(serialize = "TPM_RC_VALUE")]
    Value = RC_FMT1 + 0x004,
    #[strum(serialize = "TPM_RC_HIERARCHY")]
    Hierarchy = RC_FMT1 + 0x005,
    #[strum(serialize = "TPM_RC_KEY_SIZE")]
    KeySize = RC_FMT1 + 0x007,
    #[strum(serialize = "TPM_RC_MGF")]
    Mgf = RC_FMT1 + 0x008,
    #[strum(serialize = "TPM_RC_MODE")]
    Mode = RC_FMT1 + 0x009,
    #[strum(serialize = "TPM_RC_TYPE")]
    Type = RC_FMT1 + 0x00A,
    #[strum(serialize = "TPM_RC_HANDLE")]
    Handle = RC_FMT1 + 0x00B,
    #[strum(serialize = "TPM_RC_KDF")]
    Kdf = RC_FMT1 + 0x00C,
    #[strum(serialize = "TPM_RC_RANGE")]
    Range = RC_FMT1 + 0x00D,
    #[strum(serialize = "TPM_RC_AUTH_FAIL")]
    AuthFail = RC_FMT1 + 0x00E,
    #[strum(serialize = "TPM_RC_NONCE")]
    Nonce = RC_FMT1 + 0x00F,
    #[strum(serialize = "TPM_RC_PP")]
    Pp = RC_FMT1 + 0x010,
    #[strum(serialize = "TPM_RC_SCHEME")]
    Scheme = RC_FMT1 + 0x012,
    #[strum(serialize = "TPM_RC_SIZE")]
    Size = RC_FMT1 + 0x015,
    #[strum(serialize = "TPM_RC_SYMMETRIC")]
    Symmetric = RC_FMT1 + 0x016,
    #[strum(serialize = "TPM_RC_TAG")]
    Tag = RC_FMT1 + 0x017,
    #[strum(serialize = "TPM_RC_SELECTOR")]
    Selector = RC_FMT1 + 0x018,
    #[strum(serialize = "TPM_RC_INSUFFICIENT")]
    Insufficient = RC_FMT1 + 0x01A,
    #[strum(serialize = "TPM_RC_SIGNATURE")]
    Signature = RC_FMT1 + 0x01B,
    #[strum(serialize = "TPM_RC_KEY")]
    Key = RC_FMT1 + 0x01C,
    #[strum(serialize = "TPM_RC_POLICY_FAIL")]
    PolicyFail = RC_FMT1 + 0x01D,
    #[strum(serialize = "TPM_RC_INTEGRITY")]
    Integrity = RC_FMT1 + 0x01F,
    #[strum(serialize = "TPM_RC_TICKET")]
    Ticket = RC_FMT1 + 0x020,
    #[strum(serialize = "TPM_RC_RESERVED_BITS")]
    ReservedBits = RC_FMT1 + 0x021,
    #[strum(serialize = "TPM_RC_BAD_AUTH")]
    BadAuth = RC_FMT1 + 0x022,
    #[strum(serialize = "TPM_RC_EXPIRED")]
    Expired = RC_FMT1 + 0x023,
    #[strum(serialize = "TPM_RC_POLICY_CC")]
    PolicyCc = RC_FMT1 + 0x024,
    #[strum(serialize = "TPM_RC_BINDING")]
    Binding = RC_FMT1 + 0x025,
    #[strum(serialize = "TPM_RC_CURVE")]
    Curve = RC_FMT1 + 0x026,
    #[strum(serialize = "TPM_RC_ECC_POINT")]
    EccPoint = RC_FMT1 + 0x027,
    #[strum(serialize = "TPM_RC_CONTEXT_GAP")]
    ContextGap = RC_WARN + 0x001,
    #[strum(serialize = "TPM_RC_OBJECT_MEMORY")]
    ObjectMemory = RC_WARN + 0x002,
    #[strum(serialize = "TPM_RC_SESSION_MEMORY")]
    SessionMemory = RC_WARN + 0x003,
    #[strum(serialize = "TPM_RC_MEMORY")]
    Memory = RC_WARN + 0x004,
    #[strum(serialize = "TPM_RC_SESSION_HANDLES")]
    SessionHandles = RC_WARN + 0x005,
    #[strum(serialize = "TPM_RC_OBJECT_HANDLES")]
    ObjectHandles = RC_WARN + 0x006,
    #[strum(serialize = "TPM_RC_LOCALITY")]
    Locality = RC_WARN + 0x007,
    #[strum(serialize = "TPM_RC_YIELDED")]
    Yielded = RC_WARN + 0x008,
    #[strum(serialize = "TPM_RC_CANCELED")]
    Canceled = RC_WARN + 0x009,
    #[strum(serialize = "TPM_RC_TESTING")]
    Testing = RC_WARN + 0x00A,
    #[strum(serialize = "TPM_RC_REFERENCE_H0")]
    ReferenceH0 = RC_WARN + 0x010,
    #[strum(serialize = "TPM_RC_REFERENCE_H1")]
    ReferenceH1 = RC_WARN + 0x011,
    #[strum(serialize = "TPM_RC_REFERENCE_H2")]
    ReferenceH2 = RC_WARN + 0x012,
    #[strum(serialize = "TPM_RC_REFERENCE_H3")]
    ReferenceH3 = RC_WARN + 0x013,
    #[strum(serialize = "TPM_RC_REFERENCE_H4")]
    ReferenceH4 = RC_WARN + 0x014,
    #[strum(serialize = "TPM_RC_REFERENCE_H5")]
    ReferenceH5 = RC_WARN + 0x015,
    #[strum(serialize = "TPM_RC_REFERENCE_H6")]
    ReferenceH6 = RC_WARN + 0x016,
    #[strum(serialize = "TPM_RC_REFERENCE_S0")]
    ReferenceS0 = RC_WARN + 0x018,
    #[strum(serialize = "TPM_RC_REFERENCE_S1")]
    ReferenceS1 = RC_WARN + 0x019,
    #[strum(serialize = "TPM_RC_REFERENCE_S2")]
    ReferenceS2 = RC_WARN + 0x01A,
    #[strum(serialize = "TPM_RC_REFERENCE_S3")]
    ReferenceS3 = RC_WARN + 0x01B,
    #[strum(serialize = "TPM_RC_REFERENCE_S4")]
    ReferenceS4 = RC_WARN + 0x01C,
    #[strum(serialize = "TPM_RC_REFERENCE_S5")]
    ReferenceS5 = RC_WARN + 0x01D,
    #[strum(serialize = "TPM_RC_REFERENCE_S6")]
    ReferenceS6 = RC_WARN + 0x01E,
    #[strum(serialize = "TPM_RC_NV_RATE")]
    NvRate = RC_WARN + 0x020,
    #[strum(serialize = "TPM_RC_LOCKOUT")]
    Lockout = RC_WARN + 0x021,
    #[strum(serialize = "TPM_RC_RETRY")]
    Retry = RC_WARN + 0x022,
    #[strum(serialize = "TPM_RC_NV_UNAVAILABLE")]
    NvUnavailable = RC_WARN + 0x023,
    #[strum(serialize = "TPM_RC_NOT_USED")]
    NotUsed = RC_WARN + 0x07F,
}

impl From<u32> for ResponseCode {
    /// On success, parse `ResponseCode`.
    /// On failure, return `ResponseCode::NotUsed` (`TPM_RC_NOT_USED`) for
    /// any invalid response code, as a TPM should never return that back
    /// to the caller in any legit use case.
    fn from(value: u32) -> ResponseCode {
        Self::from_repr(if value & RC_FMT1 != 0 {
            value & (0x3F + RC_FMT1)
        } else if value & RC_WARN != 0 {
            value & (0x7F + RC_WARN)
        } else if value & RC_VER1 != 0 {
            value & (0x7F + RC_VER1)
        } else {
            // RC_VER0
            value & 0x7F
        })
        .unwrap_or(ResponseCode::NotUsed)
    }
}

/// `TPM_HT`: handle types, encoded in the top byte of a handle.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandleType {
    /// `TPM_HT_PCR`
    Pcr = 0x00,
    /// `TPM_HT_NV_INDEX`
    NvIndex = 0x01,
    /// `TPM_HT_HMAC_SESSION` and `TPM_HT_LOADED_SESSION`
    HmacSession = 0x02,
    /// `TPM_HT_POLICY_SESSION` and `TPM_HT_SAVED_SESSION`
    PolicySession = 0x03,
    /// `TPM_HT_PERMANENT`
    Permanent = 0x40,
    /// `TPM_HT_TRANSIENT`
    Transient = 0x80,
    /// `TPM_HT_PERSISTENT`
    Persistent = 0x81,
}

/// Shift between a handle value and its `TPM_HT` type byte.
pub const HR_SHIFT: u32 = 24;

/// Mask covering the type byte of a handle; the low 24 bits are the
/// per-type index space.
pub const HR_RANGE_MASK: u32 = 0xFF00_0000;

impl HandleType {
    /// Handle type encoded in the top byte of `handle`.
    #[must_use]
    pub fn of(handle: u32) -> Option<HandleType> {
        Self::from_repr((handle >> HR_SHIFT) as u8)
    }

    /// True for the handle types tracked as authorization sessions.
    #[must_use]
    pub fn is_session(self) -> bool {
        matches!(self, HandleType::HmacSession | HandleType::PolicySession)
    }
}

/// `TPM_RH` permanent handles used by the broker and its tests.
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Permanent {
    /// `TPM_RH_OWNER`
    Owner = 0x4000_0001,
    /// `TPM_RH_NULL`
    Null = 0x4000_0007,
    /// `TPM_RS_PW`
    Password = 0x4000_0009,
    /// `TPM_RH_LOCKOUT`
    Lockout = 0x4000_000A,
    /// `TPM_RH_ENDORSEMENT`
    Endorsement = 0x4000_000B,
    /// `TPM_RH_PLATFORM`
    Platform = 0x4000_000C,
}

/// The first transient handle (`TRANSIENT_FIRST`).
pub const TRANSIENT_FIRST: u32 = 0x8000_0000;

/// The first loaded session handle (`LOADED_SESSION_FIRST`).
pub const LOADED_SESSION_FIRST: u32 = 0x0200_0000;

/// The first saved session handle (`ACTIVE_SESSION_FIRST`).
pub const ACTIVE_SESSION_FIRST: u32 = 0x0300_0000;

/// `TPM_CAP`
#[derive(FromRepr, Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Capability {
    /// `TPM_CAP_ALGS`
    Algs = 0x0000_0000,
    /// `TPM_CAP_HANDLES`
    Handles = 0x0000_0001,
    /// `TPM_CAP_COMMANDS`
    Commands = 0x0000_0002,
    /// `TPM_CAP_PCRS`
    Pcrs = 0x0000_0005,
    /// `TPM_CAP_TPM_PROPERTIES`
    TpmProperties = 0x0000_0006,
}

/// `TPM_SU_CLEAR`
pub const SU_CLEAR: u16 = 0x0000;

/// `PT_FIXED`: the fixed property group.
pub const PT_FIXED: u32 = 0x0000_0100;

/// `TPM_PT_HR_TRANSIENT_MIN`: transient object slots guaranteed loadable.
pub const PT_HR_TRANSIENT_MIN: u32 = PT_FIXED + 14;

/// `TPM_PT_HR_LOADED_MIN`: session slots guaranteed loadable.
pub const PT_HR_LOADED_MIN: u32 = PT_FIXED + 16;

/// `TPM_PT_ACTIVE_SESSIONS_MAX`
pub const PT_ACTIVE_SESSIONS_MAX: u32 = PT_FIXED + 17;

/// `TPM_PT_CONTEXT_GAP_MAX`
pub const PT_CONTEXT_GAP_MAX: u32 = PT_FIXED + 20;

/// `TPM_PT_MAX_COMMAND_SIZE`
pub const PT_MAX_COMMAND_SIZE: u32 = PT_FIXED + 30;

/// `TPM_PT_MAX_RESPONSE_SIZE`
pub const PT_MAX_RESPONSE_SIZE: u32 = PT_FIXED + 31;

/// `TPM_PT_TOTAL_COMMANDS`
pub const PT_TOTAL_COMMANDS: u32 = PT_FIXED + 41;

/// `MAX_TPM_PROPERTIES`: properties requested per capability query.
pub const MAX_TPM_PROPERTIES: u32 = 64;

/// `MAX_CAP_HANDLES`: handles requested per capability query.
pub const MAX_CAP_HANDLES: u32 = 254;

bitflags! {
    /// `TPMA_CC`: command attributes, as reported by the TPM through
    /// `TPM2_GetCapability(TPM_CAP_COMMANDS)`.
    ///
    /// The flag bits are described in the section 8.9 of the TPM 2.0
    /// Structures specification. The multi-bit `commandIndex` and
    /// `cHandles` fields are exposed through accessors.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CommandAttributes: u32 {
        /// `nv`: the command may write to NV
        const NV = 1 << 22;
        /// `extensive`: the command could flush many objects
        const EXTENSIVE = 1 << 23;
        /// `flushed`: the command flushes any transient it refers to
        const FLUSHED = 1 << 24;
        /// `rHandle`: the response carries a handle
        const R_HANDLE = 1 << 28;
        /// `V`: vendor specific command
        const V = 1 << 29;
        // Retain the commandIndex and cHandles fields.
        const _ = !0;
    }
}

const CHANDLES_MASK: u32 = 0x0E00_0000;
const CHANDLES_SHIFT: u32 = 25;
const COMMAND_INDEX_MASK: u32 = 0x0000_FFFF;

impl CommandAttributes {
    /// The `commandIndex` field: low 16 bits of the command code.
    #[must_use]
    pub fn command_index(self) -> u16 {
        (self.bits() & COMMAND_INDEX_MASK) as u16
    }

    /// The `cHandles` field: number of handles in the command handle area.
    #[must_use]
    pub fn handle_count(self) -> u8 {
        ((self.bits() & CHANDLES_MASK) >> CHANDLES_SHIFT) as u8
    }

    /// True when the corresponding response carries a handle.
    #[must_use]
    pub fn has_response_handle(self) -> bool {
        self.contains(CommandAttributes::R_HANDLE)
    }
}

/// Format-one `TPM_RC_HANDLE` referencing the `number`th command handle,
/// 1-based, as the TPM itself would report a bad handle in that position.
#[must_use]
pub fn rc_handle_number(number: u8) -> u32 {
    ResponseCode::Handle as u32 + (u32::from(number) << 8)
}
