//! Integration Test: Layering and Error Propagation
//!
//! **Policy**:
//! - Only `relay/core/src/backend` may use the HTTP client
//! - Production code propagates errors instead of calling unwrap()/expect()

use architectural_enforcement::{find_violations, report, PRODUCTION_DIRS};

#[test]
fn test_http_client_confined_to_backend() {
    let violations = find_violations(&PRODUCTION_DIRS, |path, code| {
        let in_backend = path.components().any(|c| c.as_os_str() == "backend");
        !in_backend && code.contains("reqwest")
    });
    report("HTTP client used outside the transport layer", &violations);
}

#[test]
fn test_no_unwrap_in_production_code() {
    let violations = find_violations(&PRODUCTION_DIRS, |_, code| {
        code.contains(".unwrap()") || code.contains(".expect(")
    });
    report("unwrap()/expect() in production code", &violations);
}
