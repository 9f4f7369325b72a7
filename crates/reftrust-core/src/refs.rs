//! Well-known reference names.

/// Reference whose tip is the head of the reference state log.
pub const RSL_REF: &str = "refs/gittuf/reference-state-log";

/// Reference holding signed root-of-trust and rule-set versions.
pub const POLICY_REF: &str = "refs/gittuf/policy";

/// Reference holding attestation envelopes.
pub const ATTESTATIONS_REF: &str = "refs/gittuf/attestations";

/// Expand a short branch name into a fully qualified reference.
///
/// Names already under `refs/` are returned unchanged.
#[must_use]
pub fn absolute_reference(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("refs/heads/{name}")
    }
}

/// Whether `name` belongs to the trust overlay itself.
#[must_use]
pub fn is_overlay_ref(name: &str) -> bool {
    name.starts_with("refs/gittuf/")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_reference() {
        assert_eq!(absolute_reference("main"), "refs/heads/main");
        assert_eq!(absolute_reference("refs/tags/v1"), "refs/tags/v1");
    }

    #[test]
    fn test_overlay_refs() {
        assert!(is_overlay_ref(RSL_REF));
        assert!(is_overlay_ref(POLICY_REF));
        assert!(is_overlay_ref(ATTESTATIONS_REF));
        assert!(!is_overlay_ref("refs/heads/main"));
    }
}
