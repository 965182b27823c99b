//! Identifier helpers
//!
//! Entity ids are opaque strings. Ids minted by the control plane are v4
//! UUIDs; ids arriving on the event stream are kept verbatim.

use uuid::Uuid;

/// Mint a fresh entity id
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Composite id of a resource variable
pub fn resource_variable_id(resource_id: &str, key: &str) -> String {
    format!("{}-{}", resource_id, key)
}

/// Composite id of a user approval record
pub fn approval_record_id(version_id: &str, user_id: &str) -> String {
    format!("{}{}", version_id, user_id)
}

/// Composite id of a release target
pub fn release_target_key(resource_id: &str, environment_id: &str, deployment_id: &str) -> String {
    format!("{}-{}-{}", resource_id, environment_id, deployment_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_ids() {
        assert_eq!(release_target_key("r1", "e1", "d1"), "r1-e1-d1");
        assert_eq!(resource_variable_id("r1", "replicas"), "r1-replicas");
        assert_eq!(approval_record_id("v1", "u1"), "v1u1");
        assert_ne!(new_id(), new_id());
    }
}
