//! Tenant identity and caller context.
//!
//! Every entity operation takes an [`OperationContext`]. It identifies the
//! tenant (used by the adapter pool to pick a backend) and the caller's
//! [`Capabilities`] (used by authorization hooks to gate fields and scopes).

mod capabilities;
mod context;
mod id;

pub use capabilities::Capabilities;
pub use context::OperationContext;
pub use id::TenantId;
