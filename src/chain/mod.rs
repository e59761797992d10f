//! Multi-hop chain resolution and credential lifecycle

mod credentials;
mod resolver;

pub use credentials::CredentialSet;
pub use resolver::{ChainResolver, Hop, HopAuth, ResolvedChain};
