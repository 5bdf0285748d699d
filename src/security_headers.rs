use lazy_static::lazy_static;

pub struct SecurityPolicy {
    pub strict_transport_security_max_age_days: u32,
}

impl Default for SecurityPolicy {
    fn default() -> Self {
        Self {
            strict_transport_security_max_age_days: 365,
        }
    }
}

/// Headers attached to every response, in a fixed order.
pub fn security_headers(policy: &SecurityPolicy) -> Vec<(&'static str, String)> {
    let max_age_secs = u64::from(policy.strict_transport_security_max_age_days) * 24 * 60 * 60;

    vec![
        (
            "Strict-Transport-Security",
            format!("max-age={max_age_secs}; includeSubDomains"),
        ),
        (
            "Content-Security-Policy",
            "default-src 'none'; style-src 'self'; img-src 'self'; frame-ancestors 'none'; base-uri 'none'; form-action 'none'".to_string(),
        ),
        ("X-Content-Type-Options", "nosniff".to_string()),
        ("X-Frame-Options", "DENY".to_string()),
        ("Referrer-Policy", "no-referrer".to_string()),
        (
            "Permissions-Policy",
            "camera=(), geolocation=(), microphone=(), payment=(), usb=()".to_string(),
        ),
        ("Cross-Origin-Embedder-Policy", "require-corp".to_string()),
        ("Cross-Origin-Opener-Policy", "same-origin".to_string()),
        ("Cross-Origin-Resource-Policy", "same-origin".to_string()),
        ("Cache-Control", "no-store".to_string()),
    ]
}

lazy_static! {
    pub static ref SECURITY_HEADERS: Vec<(&'static str, String)> =
        security_headers(&SecurityPolicy::default());
}
