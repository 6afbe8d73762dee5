//! Integration tests for the Runtime API with the Lua guest

use hubscript_runtime::{
    ExecutionPhase, NetworkConfig, Runtime, RuntimeConfig, RuntimeError, TrackerConfig,
};
use serde_json::json;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(5);

fn fast_config() -> RuntimeConfig {
    RuntimeConfig {
        tracker: TrackerConfig {
            poll_interval_ms: 5,
            shutdown_timeout_ms: 2_000,
            ..TrackerConfig::default()
        },
        ..RuntimeConfig::default()
    }
}

async fn eventually(runtime: &Runtime, source: &str, expected: serde_json::Value) {
    for _ in 0..200 {
        let result = runtime.submit_execution(source, TIMEOUT).await.unwrap();
        if result.result.as_ref() == Some(&expected) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("`{source}` never returned {expected}");
}

#[tokio::test]
async fn test_submit_returns_value() {
    let runtime = Runtime::new().unwrap();

    let result = runtime.submit_execution("return 1+1", TIMEOUT).await.unwrap();
    assert!(result.success);
    assert_eq!(result.result, Some(json!(2)));
    assert_eq!(result.error, None);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_submit_reports_guest_error() {
    let runtime = Runtime::new().unwrap();

    let result = runtime
        .submit_execution("error('boom')", TIMEOUT)
        .await
        .unwrap();
    assert!(!result.success);
    assert!(result.error.unwrap().contains("boom"));

    // The interpreter is still usable afterwards
    let result = runtime.submit_execution("return 'ok'", TIMEOUT).await.unwrap();
    assert_eq!(result.result, Some(json!("ok")));
    assert_eq!(runtime.stats().snapshot().failed, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_globals_persist_between_submissions() {
    let runtime = Runtime::new().unwrap();

    runtime
        .submit_execution("counter = 10", TIMEOUT)
        .await
        .unwrap();
    let result = runtime
        .submit_execution("counter = counter + 1; return counter", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result.result, Some(json!(11)));

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_submit_from_threads() {
    let runtime = Runtime::new().unwrap();
    runtime.submit_execution("total = 0", TIMEOUT).await.unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let bridge = runtime.bridge();
            std::thread::spawn(move || {
                for _ in 0..25 {
                    let result = bridge.submit("total = total + 1", Some(TIMEOUT)).unwrap();
                    assert!(result.success);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let result = runtime.submit_execution("return total", TIMEOUT).await.unwrap();
    assert_eq!(result.result, Some(json!(100)));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_set_timeout_zero_fires_once() {
    let runtime = Runtime::new().unwrap();

    runtime
        .submit_execution(
            "count = 0; setTimeout(function() count = count + 1 end, 0)",
            TIMEOUT,
        )
        .await
        .unwrap();

    eventually(&runtime, "return count", json!(1)).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let result = runtime.submit_execution("return count", TIMEOUT).await.unwrap();
    assert_eq!(result.result, Some(json!(1)));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_callbacks_never_interleave_with_execution() {
    let runtime = Runtime::new().unwrap();

    // The timer is due long before the busy loop ends, but its callback can
    // only run once the submission has returned.
    runtime
        .submit_execution(
            "fired_during = nil
             busy = true
             setTimeout(function() fired_during = busy end, 0)
             local start = os.clock()
             while os.clock() - start < 0.1 do end
             busy = false",
            TIMEOUT,
        )
        .await
        .unwrap();

    eventually(&runtime, "return fired_during", json!(false)).await;
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_execution_timeout_is_distinct_error() {
    let runtime = Runtime::new().unwrap();

    let err = runtime
        .submit_execution(
            "local start = os.clock(); while os.clock() - start < 0.3 do end; slow_done = true",
            Duration::from_millis(50),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ExecutionTimeout { .. }));

    // Not killed: it finishes later and the next submission sees its effect
    let result = runtime
        .submit_execution("return slow_done", TIMEOUT)
        .await
        .unwrap();
    assert_eq!(result.result, Some(json!(true)));
    assert_eq!(runtime.stats().snapshot().timed_out, 1);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_main_then_termination() {
    let runtime = Runtime::builder().config(fast_config()).build().unwrap();

    let result = runtime
        .run_main("done = false; setTimeout(function() done = true end, 50)", "main.lua")
        .await
        .unwrap();
    assert!(result.success);
    assert_eq!(runtime.phase(), ExecutionPhase::Tracking);
    assert!(runtime.has_active_operations());

    runtime.wait_for_termination().await.unwrap();
    assert!(!runtime.has_active_operations());

    let result = runtime.submit_execution("return done", TIMEOUT).await.unwrap();
    assert_eq!(result.result, Some(json!(true)));

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_main_outlives_submission_timeout() {
    let config = RuntimeConfig {
        execution_timeout_ms: 50,
        ..fast_config()
    };
    let runtime = Runtime::builder().config(config).build().unwrap();

    let result = runtime
        .run_main(
            "local start = os.clock(); while os.clock() - start < 0.2 do end; return 'done'",
            "slow.lua",
        )
        .await
        .unwrap();
    assert_eq!(result.result, Some(json!("done")));
    assert_eq!(runtime.stats().snapshot().timed_out, 0);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_main_timeout_applies_when_configured() {
    let config = RuntimeConfig {
        main_timeout_ms: Some(50),
        ..fast_config()
    };
    let runtime = Runtime::builder().config(config).build().unwrap();

    let err = runtime
        .run_main(
            "local start = os.clock(); while os.clock() - start < 0.3 do end",
            "slow.lua",
        )
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::ExecutionTimeout { .. }));
    assert_eq!(runtime.phase(), ExecutionPhase::Tracking);

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_fragments_then_main() {
    let runtime = Runtime::builder().config(fast_config()).build().unwrap();

    let results = runtime
        .run_fragments(&["x = 2".to_string(), "error('bad fragment')".to_string()], true)
        .await
        .unwrap();
    assert!(results[0].success);
    assert!(!results[1].success);
    assert!(results[1].error.as_ref().unwrap().contains("fragment 2"));
    assert_eq!(runtime.phase(), ExecutionPhase::Main);

    let result = runtime.run_main("return x * 21", "main.lua").await.unwrap();
    assert_eq!(result.result, Some(json!(42)));
    assert_eq!(runtime.phase(), ExecutionPhase::Tracking);

    runtime.wait_for_termination().await.unwrap();
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_timeout_then_force() {
    let mut config = fast_config();
    config.tracker.shutdown_timeout_ms = 200;
    let runtime = Runtime::builder().config(config).build().unwrap();

    runtime
        .run_main("setInterval(function() end, 10)", "forever.lua")
        .await
        .unwrap();

    let err = runtime.wait_for_termination().await.unwrap_err();
    assert!(matches!(err, RuntimeError::ShutdownTimeout(_)));

    let report = runtime.force_shutdown();
    assert_eq!(report.cancelled_timers, 1);
    assert!(!runtime.has_active_operations());
    runtime.wait_for_termination().await.unwrap();

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_daemon_never_terminates() {
    let mut config = fast_config();
    config.tracker.shutdown_timeout_ms = 100;
    let runtime = Runtime::builder()
        .config(config)
        .daemon(true)
        .build()
        .unwrap();

    runtime.run_main("return nil", "server.lua").await.unwrap();
    assert!(!runtime.has_active_operations());
    assert!(matches!(
        runtime.wait_for_termination().await,
        Err(RuntimeError::ShutdownTimeout(_))
    ));

    runtime.set_daemon(false);
    runtime.wait_for_termination().await.unwrap();
    runtime.shutdown().await;
}

#[tokio::test]
async fn test_interactive_never_terminates() {
    let mut config = fast_config();
    config.tracker.shutdown_timeout_ms = 100;
    let runtime = Runtime::builder().config(config).build().unwrap();

    runtime.start_interactive();
    runtime.run_main("return 1", "ignored.lua").await.unwrap();
    assert_eq!(runtime.phase(), ExecutionPhase::Interactive);
    assert!(runtime.wait_for_termination().await.is_err());

    runtime.shutdown().await;
}

#[tokio::test]
async fn test_tcp_read_without_data_keeps_connection() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = RuntimeConfig {
        network: NetworkConfig {
            read_timeout_ms: 0,
            ..NetworkConfig::default()
        },
        ..fast_config()
    };
    let runtime = Runtime::builder().config(config).build().unwrap();

    runtime
        .submit_execution(
            format!(
                "read_state = 'pending'
                 tcp_connect('127.0.0.1', {port}, function(ok, conn)
                     if not ok then read_state = 'connect failed'; return end
                     tcp_read(conn, nil, function(ok, data)
                         if ok and data == nil then read_state = 'no data'
                         elseif ok then read_state = 'data'
                         else read_state = 'error: ' .. data end
                     end)
                 end)"
            ),
            TIMEOUT,
        )
        .await
        .unwrap();
    let (_peer, _) = listener.accept().await.unwrap();

    eventually(&runtime, "return read_state", json!("no data")).await;

    let tally = runtime.tally();
    assert_eq!(tally.open_connections, 1);
    assert!(runtime.has_active_operations());

    runtime.shutdown().await;
}
