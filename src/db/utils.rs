use uuid::Uuid;

/// Human-readable transaction reference, e.g. `P2P-3F2A9C1B`.
pub fn reference(prefix: &str) -> String {
    let id = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", id[..8].to_ascii_uppercase())
}

#[inline]
pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}
