//! Guarded calls to a flaky translation backend
//!
//! Run with `RUST_LOG=debug cargo run --example basic` to see the guard's logs.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use translate_guard::{Guard, OperationError};

/// Pretend backend: busy for the first two requests, then healthy
fn translate(calls: &AtomicU32, text: &str) -> Result<String, OperationError> {
    match calls.fetch_add(1, Ordering::SeqCst) {
        0 => Err(OperationError::Status {
            code: 503,
            message: "backend warming up".into(),
        }),
        1 => Err(OperationError::Transport("connection reset".into())),
        _ => Ok(format!("[de] {}", text)),
    }
}

/// Synchronous calls: retries, non-retryable errors, then a fast-failing open circuit
fn blocking_calls(guard: &Guard) {
    println!("--- Transient failures are retried ---");
    let calls = AtomicU32::new(0);
    match guard.execute(|| translate(&calls, "good morning")) {
        Ok(text) => println!("✓ {} (after {} attempts)", text, calls.load(Ordering::SeqCst)),
        Err(e) => println!("✗ {}", e),
    }

    println!("\n--- Client errors are not ---");
    for _ in 0..2 {
        let result = guard.execute(|| {
            Err::<String, _>(OperationError::Status {
                code: 400,
                message: "unsupported language pair".into(),
            })
        });
        if let Err(e) = result {
            println!("✗ {}", e);
        }
    }
    println!("State: {}\n", guard.breaker().state_name());

    println!("--- Calling while open ---");
    if let Err(e) = guard.execute(|| Ok::<_, OperationError>("never sent".to_string())) {
        println!("✗ {}", e);
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Translate Guard Basic Example ===\n");

    let guard = Guard::builder("translate_api")
        .permits_per_second(5)
        .failure_threshold(2)
        .reset_timeout(Duration::from_secs(1))
        .max_attempts(3)
        .base_delay(Duration::from_millis(50))
        .on_open(|t| println!("🔴 Circuit '{}' opened!", t.circuit))
        .on_close(|t| println!("🟢 Circuit '{}' closed!", t.circuit))
        .on_half_open(|t| println!("🟡 Circuit '{}' half-open, testing...", t.circuit))
        .build()
        .expect("valid configuration");

    // The blocking API sleeps on the calling thread, keep it off the runtime workers
    let blocking = guard.clone();
    tokio::task::spawn_blocking(move || blocking_calls(&blocking))
        .await
        .expect("blocking demo panicked");

    println!("\n--- Async probe after the reset timeout ---");
    tokio::time::sleep(Duration::from_millis(1100)).await;
    let calls = Arc::new(AtomicU32::new(2));
    let counter = Arc::clone(&calls);
    let handle = guard.execute_async(move || {
        let result = translate(&counter, "see you tomorrow");
        async move { result }
    });
    match handle.await {
        Ok(text) => println!("✓ {}", text),
        Err(e) => println!("✗ {}", e),
    }

    let stats = guard.stats();
    println!(
        "\nState: {} | successes: {} | failures: {} | retries: {} | rejections: {}",
        stats.circuit.state.as_str(),
        stats.metrics.successes,
        stats.metrics.failures,
        stats.metrics.retries,
        stats.metrics.rejections
    );
}
