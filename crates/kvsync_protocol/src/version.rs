//! Software version constants.
//!
//! Peers exchange their software version during ability sync; behavior that
//! changed between releases is keyed on these values.

/// First release.
pub const SOFTWARE_VERSION_RELEASE_1_0: u32 = 101;
/// Adds ability sync with schema exchange.
pub const SOFTWARE_VERSION_RELEASE_2_0: u32 = 102;
/// Adds security labels and subscribe/unsubscribe control commands.
pub const SOFTWARE_VERSION_RELEASE_3_0: u32 = 103;
/// Adds db creation time exchange.
pub const SOFTWARE_VERSION_RELEASE_4_0: u32 = 104;
/// Version spoken by this build.
pub const SOFTWARE_VERSION_CURRENT: u32 = SOFTWARE_VERSION_RELEASE_4_0;

/// Current time sync packet layout.
pub const TIME_SYNC_VERSION_V1: u32 = 1;
