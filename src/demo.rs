//! Scenario walkthrough against a running server.

use rpcretry::{CallOptions, CallResponse, RpcClient, Status};
use serde_json::json;

fn show(label: &str, response: &CallResponse) {
    println!("{}", label);
    match response.status {
        Status::Ok => println!(
            "   Result: {}, Status: OK, Attempt: {}, Latency: {:.3}s",
            response.result.clone().unwrap_or_default(),
            response.attempt.unwrap_or(1),
            response.latency.unwrap_or_default()
        ),
        status => println!(
            "   Error: {}, Status: {:?}, Attempts: {}",
            response.error.as_deref().unwrap_or("-"),
            status,
            response.attempts.or(response.attempt).unwrap_or(1)
        ),
    }
}

pub async fn run(client: &RpcClient) {
    let policy = *client.policy();

    println!("\n1. NORMAL OPERATION");
    show("a) add(5, 7)", &client.call("add", json!({"a": 5, "b": 7})).await);
    show("b) multiply(3, 4)", &client.call("multiply", json!({"a": 3, "b": 4})).await);
    show(
        "c) reverse_string('hello world')",
        &client.call("reverse_string", json!({"s": "hello world"})).await,
    );
    show("d) get_time()", &client.call("get_time", json!({})).await);

    println!("\n2. METHOD NOT FOUND");
    show(
        "non_existent_method",
        &client.call("non_existent_method", json!({"x": 1})).await,
    );

    // A delay comfortably past the per-attempt timeout
    let long_delay = (policy.timeout.as_secs_f64() * 2.5).ceil();
    println!(
        "\n3. SERVER DELAY ({}s) vs TIMEOUT ({:.1}s), {} attempts",
        long_delay,
        policy.timeout.as_secs_f64(),
        policy.max_retries
    );
    let response = client
        .call_with(
            "simulate_delay",
            json!({"delay_seconds": long_delay}),
            CallOptions::default().force_timeout(),
        )
        .await;
    show("simulate_delay", &response);
    if response.status == Status::TimeoutError {
        println!("   Retried with the same request_id: at-least-once delivery");
    }

    println!("\n4. NETWORK FAILURE");
    show(
        "add(2, 3) via failure target",
        &client
            .call_with(
                "add",
                json!({"a": 2, "b": 3}),
                CallOptions::default().simulate_failure(),
            )
            .await,
    );

    let short_delay = (policy.timeout.as_secs_f64() / 2.0).floor().max(0.0);
    println!("\n5. SHORT DELAY ({}s) within timeout", short_delay);
    show(
        "simulate_delay",
        &client
            .call("simulate_delay", json!({"delay_seconds": short_delay}))
            .await,
    );
}
