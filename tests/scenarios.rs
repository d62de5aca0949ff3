//! End-to-end scenarios against the scripted CDP stub: commands go in
//! through the mapper, CDP events are injected by hand, and the outbound
//! channel is asserted message by message.

use std::time::{Duration, Instant};

mod common;
use common::Harness;

/// Intercepted request with the CDP events arriving in reverse order:
/// exactly one blocked `network.beforeRequestSent`.
#[tokio::test]
async fn before_request_sent_reverse_order_with_intercept() {
    let mut harness = Harness::new();
    harness.attach_page("ctx-1", "session-1", "http://www.google.com/");

    let subscribe = harness.command(
        "session.subscribe",
        serde_json::json!({"events": ["network"]}),
        None,
    );
    harness.expect_result(subscribe).await;

    let add = harness.command(
        "network.addIntercept",
        serde_json::json!({
            "phases": ["beforeRequestSent"],
            "urlPatterns": [{"type": "string", "pattern": "http://www.google.com"}],
        }),
        None,
    );
    let intercept = harness.expect_result(add).await["intercept"]
        .as_str()
        .unwrap()
        .to_string();

    harness.cdp_event(
        Some("session-1"),
        "Fetch.requestPaused",
        serde_json::json!({
            "requestId": "interception-1",
            "request": {"url": "http://www.google.com/", "method": "GET"},
            "frameId": "ctx-1",
            "networkId": "request-1",
        }),
    );
    harness.cdp_event(
        Some("session-1"),
        "Network.requestWillBeSent",
        serde_json::json!({
            "requestId": "request-1",
            "frameId": "ctx-1",
            "request": {"url": "http://www.google.com/", "method": "GET"},
            "initiator": {"type": "other"},
        }),
    );

    let params = harness.expect_event("network.beforeRequestSent").await;
    assert_eq!(params["isBlocked"], true);
    assert_eq!(params["intercepts"], serde_json::json!([intercept]));
    assert_eq!(params["request"]["url"], "http://www.google.com/");

    // a later extra-info event must not produce a second emission
    harness.cdp_event(
        Some("session-1"),
        "Network.requestWillBeSentExtraInfo",
        serde_json::json!({"requestId": "request-1"}),
    );
    let marker = harness.command(
        "session.unsubscribe",
        serde_json::json!({"events": ["network"]}),
        None,
    );
    harness.expect_result(marker).await;
}

/// Subscription ordering across channels and module expansion.
#[tokio::test]
async fn subscription_order_across_channels() {
    let mut harness = Harness::new();
    harness.attach_page("ctx-1", "session-1", "about:blank");

    for (events, channel) in [
        (vec!["browsingContext.load", "browsingContext.contextCreated"], "x"),
        (vec!["browsingContext.load"], "y"),
        (vec!["network"], "x"),
    ] {
        let id = harness.command(
            "session.subscribe",
            serde_json::json!({"events": events}),
            Some(channel),
        );
        harness.expect_result(id).await;
    }

    let subscriptions = harness.mapper.subscriptions();
    assert_eq!(
        subscriptions.channels_subscribed_to("browsingContext.load", Some("ctx-1")),
        vec![Some("x".to_string()), Some("y".to_string())]
    );
    assert_eq!(
        subscriptions.channels_subscribed_to("network.beforeRequestSent", Some("ctx-1")),
        vec![Some("x".to_string())]
    );
}

/// `navigate` with `wait: complete` resolves once load fires, with
/// `navigationStarted` / `domContentLoaded` / `load` sharing the
/// navigation id.
#[tokio::test]
async fn navigate_complete_lifecycle() {
    let mut harness = Harness::new();
    harness.attach_page("ctx-1", "session-1", "about:blank");
    harness
        .conn
        .respond("Page.navigate", serde_json::json!({"loaderId": "loader-1"}));

    let subscribe = harness.command(
        "session.subscribe",
        serde_json::json!({"events": ["browsingContext"]}),
        None,
    );
    harness.expect_result(subscribe).await;

    let navigate = harness.command(
        "browsingContext.navigate",
        serde_json::json!({
            "context": "ctx-1",
            "url": "https://example.com/",
            "wait": "complete",
        }),
        None,
    );

    // let the command reach its wait point, then run the document
    // lifecycle
    tokio::time::sleep(Duration::from_millis(50)).await;
    for name in ["init", "commit", "DOMContentLoaded", "load"] {
        harness.cdp_event(
            Some("session-1"),
            "Page.lifecycleEvent",
            serde_json::json!({
                "frameId": "ctx-1",
                "loaderId": "loader-1",
                "name": name,
            }),
        );
    }

    let result = harness.expect_result(navigate).await;
    let navigation = result["navigation"].as_str().unwrap().to_string();
    assert_eq!(result["url"], "https://example.com/");

    let started = harness.expect_event("browsingContext.navigationStarted").await;
    assert_eq!(started["navigation"], navigation.as_str());
    let dcl = harness.expect_event("browsingContext.domContentLoaded").await;
    assert_eq!(dcl["navigation"], navigation.as_str());
    let load = harness.expect_event("browsingContext.load").await;
    assert_eq!(load["navigation"], navigation.as_str());
    assert_eq!(load["url"], "https://example.com/");
}

/// A CDP-scheduled navigation supersedes a pending client navigation: the
/// first command still resolves, the abort is announced, and a fresh
/// navigation starts.
#[tokio::test]
async fn interrupted_navigation_aborts_and_restarts() {
    let mut harness = Harness::new();
    harness.attach_page("ctx-1", "session-1", "about:blank");
    harness
        .conn
        .respond("Page.navigate", serde_json::json!({"loaderId": "loader-1"}));

    let subscribe = harness.command(
        "session.subscribe",
        serde_json::json!({"events": ["browsingContext"]}),
        None,
    );
    harness.expect_result(subscribe).await;

    let navigate = harness.command(
        "browsingContext.navigate",
        serde_json::json!({
            "context": "ctx-1",
            "url": "https://a.example/",
            "wait": "complete",
        }),
        None,
    );
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.cdp_event(
        Some("session-1"),
        "Page.frameRequestedNavigation",
        serde_json::json!({
            "frameId": "ctx-1",
            "url": "https://b.example/",
            "reason": "scriptInitiated",
        }),
    );

    let result = harness.expect_result(navigate).await;
    let first_navigation = result["navigation"].as_str().unwrap().to_string();

    let started = harness.expect_event("browsingContext.navigationStarted").await;
    assert_eq!(started["navigation"], first_navigation.as_str());
    let aborted = harness.expect_event("browsingContext.navigationAborted").await;
    assert_eq!(aborted["navigation"], first_navigation.as_str());
    let restarted = harness.expect_event("browsingContext.navigationStarted").await;
    assert_eq!(restarted["url"], "https://b.example/");
    assert_ne!(restarted["navigation"], first_navigation.as_str());
}

/// Structured URL patterns match by field; a non-matching paused request is
/// auto-continued and reported unblocked.
#[tokio::test]
async fn url_pattern_matching_controls_blocking() {
    let mut harness = Harness::new();
    harness.attach_page("ctx-1", "session-1", "about:blank");

    let subscribe = harness.command(
        "session.subscribe",
        serde_json::json!({"events": ["network.beforeRequestSent"]}),
        None,
    );
    harness.expect_result(subscribe).await;

    let add = harness.command(
        "network.addIntercept",
        serde_json::json!({
            "phases": ["beforeRequestSent"],
            "urlPatterns": [{"type": "pattern", "protocol": "https", "hostname": "example.com"}],
        }),
        None,
    );
    harness.expect_result(add).await;

    // non-matching host: continued automatically, not blocked
    for (request_id, fetch_id, url) in [
        ("request-1", "interception-1", "https://example.org/aa"),
        ("request-2", "interception-2", "https://example.com/aa"),
    ] {
        harness.cdp_event(
            Some("session-1"),
            "Network.requestWillBeSent",
            serde_json::json!({
                "requestId": request_id,
                "frameId": "ctx-1",
                "request": {"url": url, "method": "GET"},
                "initiator": {"type": "other"},
            }),
        );
        harness.cdp_event(
            Some("session-1"),
            "Fetch.requestPaused",
            serde_json::json!({
                "requestId": fetch_id,
                "request": {"url": url, "method": "GET"},
                "frameId": "ctx-1",
                "networkId": request_id,
            }),
        );
    }

    let unmatched = harness.expect_event("network.beforeRequestSent").await;
    assert_eq!(unmatched["request"]["url"], "https://example.org/aa");
    assert_eq!(unmatched["isBlocked"], false);

    let matched = harness.expect_event("network.beforeRequestSent").await;
    assert_eq!(matched["request"]["url"], "https://example.com/aa");
    assert_eq!(matched["isBlocked"], true);

    // the unmatched request went through on its own
    tokio::time::sleep(Duration::from_millis(20)).await;
    let continued = harness.conn.sent_matching("Fetch.continueRequest");
    assert_eq!(continued.len(), 1);
    assert_eq!(continued[0]["requestId"], "interception-1");
}

/// One tick lasts as long as its longest action, and tweened moves emit
/// monotonic intermediate coordinates.
#[tokio::test]
async fn input_tick_duration_and_tween() {
    let mut harness = Harness::new();
    harness.attach_page("ctx-1", "session-1", "about:blank");

    let start = Instant::now();
    let perform = harness.command(
        "input.performActions",
        serde_json::json!({
            "context": "ctx-1",
            "actions": [
                {
                    "type": "pointer",
                    "id": "mouse",
                    "parameters": {"pointerType": "mouse"},
                    "actions": [
                        {"type": "pointerMove", "x": 100.0, "y": 100.0, "duration": 200},
                    ],
                },
                {
                    "type": "none",
                    "id": "pauser",
                    "actions": [{"type": "pause", "duration": 50}],
                },
            ],
        }),
        None,
    );
    harness.expect_result(perform).await;
    assert!(
        start.elapsed() >= Duration::from_millis(200),
        "tick finished before its longest action"
    );

    let moves: Vec<(i64, i64)> = harness
        .conn
        .sent_matching("Input.dispatchMouseEvent")
        .into_iter()
        .filter(|p| p["type"] == "mouseMoved")
        .map(|p| (p["x"].as_i64().unwrap(), p["y"].as_i64().unwrap()))
        .collect();
    assert!(moves.len() >= 2, "expected intermediate moves, got {moves:?}");
    for pair in moves.windows(2) {
        assert!(pair[0].0 < pair[1].0, "x not strictly monotonic: {moves:?}");
        assert!(pair[0].1 < pair[1].1, "y not strictly monotonic: {moves:?}");
    }
    assert_eq!(*moves.last().unwrap(), (100, 100));
}

/// Activation restores the owning window before bringing the page to the
/// front.
#[tokio::test]
async fn activate_restores_window() {
    let mut harness = Harness::new();
    harness.conn.respond(
        "Browser.getWindowForTarget",
        serde_json::json!({"windowId": 77}),
    );
    harness.attach_page("ctx-1", "session-1", "about:blank");

    let activate = harness.command(
        "browsingContext.activate",
        serde_json::json!({"context": "ctx-1"}),
        None,
    );
    harness.expect_result(activate).await;

    let bounds = harness.conn.sent_matching("Browser.setWindowBounds");
    assert_eq!(bounds.len(), 1);
    assert_eq!(bounds[0]["windowId"], 77);
    assert_eq!(bounds[0]["bounds"]["windowState"], "normal");
    assert_eq!(harness.conn.sent_matching("Page.bringToFront").len(), 1);
}

/// Disposing a subtree removes every descendant and announces each one.
#[tokio::test]
async fn detach_disposes_subtree_with_events() {
    let mut harness = Harness::new();
    harness.attach_page("top", "session-1", "about:blank");

    let subscribe = harness.command(
        "session.subscribe",
        serde_json::json!({"events": ["browsingContext.contextDestroyed"]}),
        None,
    );
    harness.expect_result(subscribe).await;

    harness.cdp_event(
        Some("session-1"),
        "Page.frameAttached",
        serde_json::json!({"frameId": "child", "parentFrameId": "top"}),
    );
    harness.cdp_event(
        Some("session-1"),
        "Page.frameAttached",
        serde_json::json!({"frameId": "grandchild", "parentFrameId": "child"}),
    );
    assert!(harness.mapper.contexts().has("grandchild"));

    harness.cdp_event(
        None,
        "Target.detachedFromTarget",
        serde_json::json!({"sessionId": "session-1", "targetId": "top"}),
    );

    // deepest first, one event per removed node
    let first = harness.expect_event("browsingContext.contextDestroyed").await;
    assert_eq!(first["context"], "grandchild");
    let second = harness.expect_event("browsingContext.contextDestroyed").await;
    assert_eq!(second["context"], "child");
    let third = harness.expect_event("browsingContext.contextDestroyed").await;
    assert_eq!(third["context"], "top");

    assert!(!harness.mapper.contexts().has("top"));
    assert!(!harness.mapper.contexts().has("grandchild"));
}

/// Unsubscribing something never subscribed fails atomically.
#[tokio::test]
async fn unsubscribe_validation() {
    let mut harness = Harness::new();
    let subscribe = harness.command(
        "session.subscribe",
        serde_json::json!({"events": ["log.entryAdded"]}),
        None,
    );
    harness.expect_result(subscribe).await;

    let bad = harness.command(
        "session.unsubscribe",
        serde_json::json!({"events": ["log.entryAdded", "browsingContext.load"]}),
        None,
    );
    let (code, _) = harness.expect_error(bad).await;
    assert_eq!(code, "invalid argument");

    // the matching half survived the failed atomic removal
    assert!(harness
        .mapper
        .subscriptions()
        .is_subscribed_to("log.entryAdded", None));
}

/// Commands answered out of order still respond in request order.
#[tokio::test]
async fn responses_preserve_request_order() {
    let mut harness = Harness::new();
    harness.attach_page("ctx-1", "session-1", "about:blank");
    harness
        .conn
        .respond("Page.navigate", serde_json::json!({"loaderId": "loader-1"}));

    // slow command first: navigate waits for the load latch
    let slow = harness.command(
        "browsingContext.navigate",
        serde_json::json!({"context": "ctx-1", "url": "https://example.com/", "wait": "complete"}),
        None,
    );
    // fast command second
    let fast = harness.command("browsingContext.getTree", serde_json::json!({}), None);

    tokio::time::sleep(Duration::from_millis(50)).await;
    for name in ["init", "DOMContentLoaded", "load"] {
        harness.cdp_event(
            Some("session-1"),
            "Page.lifecycleEvent",
            serde_json::json!({"frameId": "ctx-1", "loaderId": "loader-1", "name": name}),
        );
    }

    // the slow response still comes out first
    harness.expect_result(slow).await;
    let tree = harness.expect_result(fast).await;
    assert_eq!(tree["contexts"][0]["context"], "ctx-1");
}
