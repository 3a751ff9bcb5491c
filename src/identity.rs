//! Node Identity
//!
//! Every process claims the election node with a stable identity, by default
//! its hostname. The identity doubles as the name of its slave registration
//! node, so it has to be a single path segment.

use crate::error::{Error, Result};

/// Resolve this process's identity: the configured override, else the hostname
pub fn resolve_identity(configured: Option<&str>) -> Result<String> {
    let identity = match configured {
        Some(identity) => identity.to_string(),
        None => hostname()?,
    };
    validate_identity(&identity)?;
    Ok(identity)
}

/// Read the hostname from the OS
pub fn hostname() -> Result<String> {
    let name = nix::unistd::gethostname()
        .map_err(|e| Error::Identity(format!("could not retrieve this node hostname: {}", e)))?;

    name.into_string()
        .map_err(|raw| Error::Identity(format!("hostname is not valid UTF-8: {:?}", raw)))
}

/// Check that an identity can be used as a node name
pub fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() {
        return Err(Error::Identity("identity cannot be empty".into()));
    }
    if identity.contains('/') || identity == "." || identity == ".." {
        return Err(Error::Identity(format!(
            "identity must be a single node name: {:?}",
            identity
        )));
    }
    Ok(())
}
