//! Integration Test: Sleep Prohibition
//!
//! **Policy**: Production code MUST NOT call sleep methods. Generation jobs
//! wait on transport events and cancellation tokens, never on timers.
//! **Exceptions**: test code

use architectural_enforcement::{find_violations, report, PRODUCTION_DIRS};

/// Test that production code does not contain sleep() calls
#[test]
fn test_no_sleep_in_production_code() {
    let violations = find_violations(&PRODUCTION_DIRS, |_, code| {
        code.contains("::sleep(") || code.contains(".sleep(")
    });

    if !violations.is_empty() {
        eprintln!("\n✅ ACCEPTABLE waits:");
        eprintln!("  - CancellationToken::cancelled()");
        eprintln!("  - mpsc / watch receivers");
        eprintln!("\n❌ FORBIDDEN:");
        eprintln!("  - Sleep in polling loops");
        eprintln!("  - Sleep as poor man's synchronization");
    }
    report("Sleep calls found in production code", &violations);
}
