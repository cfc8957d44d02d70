/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, identifies a remote memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the user to identify a work request.
///
/// Work requests posted by a [`PeerConnection`](crate::PeerConnection)
/// carry its [`ConnId`](crate::ConnId) here.
pub type WrId = u64;
