//! Deterministic names for derived objects
//!
//! Objects created once per external entity (an ingress hostname, an egress
//! host) are named `<parent>-<kind>-<hash16(key)>` where `hash16` is the
//! lowercase hex of the 64-bit FNV-1a hash of the key. The hex is not zero
//! padded. These names are visible in clusters and must stay stable across
//! operator versions.

/// FNV-1a 64-bit offset basis
const FNV_OFFSET: u64 = 0xcbf29ce484222325;
/// FNV-1a 64-bit prime
const FNV_PRIME: u64 = 0x100000001b3;

/// Discriminator for per-hostname ingress objects (Gateway, VirtualService, Certificate)
pub const INGRESS: &str = "ingress";

/// Discriminator for per-host egress objects (ServiceEntry)
pub const EGRESS: &str = "egress";

/// Discriminator for per-target NetworkPolicies created by a Routing
pub const ROUTING: &str = "routing";

/// 64-bit FNV-1a hash
pub const fn fnv1a_64(data: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET;
    let mut i = 0;
    while i < data.len() {
        hash ^= data[i] as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
        i += 1;
    }
    hash
}

/// Lowercase, unpadded hex of the FNV-1a hash of `key`
pub fn hash16(key: &str) -> String {
    format!("{:x}", fnv1a_64(key.as_bytes()))
}

/// `<prefix>-<kind>-<hash16(key)>`
pub fn derived_name(prefix: &str, kind: &str, key: &str) -> String {
    format!("{}-{}-{}", prefix, kind, hash16(key))
}

/// Name of the Gateway / VirtualService for one ingress hostname
pub fn ingress_name(parent: &str, hostname: &str) -> String {
    derived_name(parent, INGRESS, hostname)
}

/// Name of the ServiceEntry for one external host
pub fn egress_name(parent: &str, host: &str) -> String {
    derived_name(parent, EGRESS, host)
}

/// Whether `name` has the shape `<parent>-<kind>-<hex>`.
///
/// Used by orphan collection to restrict deletion to objects this naming
/// scheme could have produced.
pub fn matches_derived(parent: &str, kind: &str, name: &str) -> bool {
    let Some(rest) = name
        .strip_prefix(parent)
        .and_then(|r| r.strip_prefix('-'))
        .and_then(|r| r.strip_prefix(kind))
        .and_then(|r| r.strip_prefix('-'))
    else {
        return false;
    };
    !rest.is_empty() && rest.len() <= 16 && rest.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
}
