//! Transport-neutral RDMA vocabulary shared by every provider.

pub mod cq;
pub mod mr;
pub mod qp;
pub mod type_alias;
pub mod wr;
