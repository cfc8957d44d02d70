//! Memory region permissions and keys.

mod perm;

pub use self::perm::Permission;
use crate::rdma::type_alias::{LKey, RKey};

/// A registered memory region, as returned by a provider.
pub trait MemoryRegion: Send + Sync + 'static {
    /// Local key, used in scatter/gather entries of local work requests.
    fn lkey(&self) -> LKey;

    /// Remote key, handed to peers for one-sided access.
    fn rkey(&self) -> RKey;
}
