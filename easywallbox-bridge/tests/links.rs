//! Link recovery, framing and reconcile behaviour of a running bridge.

mod common;

use std::time::Duration;

use common::{Auth, Harness, MockDevice, config, eventually, settle};
use easywallbox_bridge::LinkState;
use tokio_test::assert_ok;

#[tokio::test(start_paused = true)]
async fn test_split_notification_forwarded_once() {
    let h = Harness::online(&config("")).await;

    h.device.notify("$EEP,READ,");
    h.device.notify("ST,1,0,");
    settle().await;
    assert!(h.bus.published_on("easywallbox/message").is_empty());

    h.device.notify("32\n$DATA,");
    let bus = h.bus.clone();
    eventually("reassembled frame", || {
        bus.published_on("easywallbox/message") == vec!["$EEP,READ,ST,1,0,32\n".to_string()]
    })
    .await;

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_command_answer_forwarded() {
    let h = Harness::online(&config("")).await;
    h.device.reply("$DATA,READ,SV", "$DATA,READ,SV,230\n");

    h.broker.deliver("read/voltage", "");

    let bus = h.bus.clone();
    eventually("voltage answer", || {
        bus.published_on("easywallbox/message") == vec!["$DATA,READ,SV,230\n".to_string()]
    })
    .await;

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_stream_end_triggers_reconnect() {
    let h = Harness::online(&config("")).await;
    let before = h.bus.availability().len();

    h.device.drop_connection();

    let bus = h.bus.clone();
    eventually("back online", || bus.availability().len() == before + 2).await;
    assert_eq!(h.device.opens(), 2);
    assert_eq!(
        h.bus.availability()[before..],
        ["offline".to_string(), "online".to_string()]
    );

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_liveness_detects_lost_device() {
    let h = Harness::online(&config("")).await;
    let before = h.bus.availability().len();

    h.device.go_silent();

    let device = h.device.clone();
    eventually("reconnect after liveness failure", || device.opens() == 2).await;
    let bus = h.bus.clone();
    eventually("back online", || bus.availability().len() == before + 2).await;
    assert_eq!(bus.last_availability().as_deref(), Some("online"));

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_control_topic_forces_reconnect() {
    let h = Harness::online(&config("")).await;
    let before = h.bus.availability().len();

    h.broker.deliver("control", "reconnect");

    let device = h.device.clone();
    eventually("second connection", || device.opens() == 2).await;
    let bus = h.bus.clone();
    eventually("back online", || bus.availability().len() == before + 2).await;
    assert_eq!(h.bridge.wireless().state(), LinkState::Ready);

    // Unknown control payloads are ignored.
    h.broker.deliver("control", "reboot");
    settle().await;
    assert_eq!(h.device.opens(), 2);

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_login_accepted_by_default() {
    let device = MockDevice::new();
    device.set_auth(Auth::Silent);
    let h = Harness::start(&config(""), device);
    h.broker.accept();

    let bus = h.bus.clone();
    eventually("online", || bus.last_availability().as_deref() == Some("online")).await;
    assert_eq!(h.device.opens(), 1);

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_silent_login_rejected_when_ack_required() {
    let mut config = config("");
    config.wallbox.require_auth_ack = true;
    let device = MockDevice::new();
    device.set_auth(Auth::Silent);
    let h = Harness::start(&config, device);
    h.broker.accept();

    let device = h.device.clone();
    eventually("retries", || device.opens() >= 2).await;
    assert!(h.bus.availability().iter().all(|a| a == "offline"));

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_cap_parks_until_requested() {
    let device = MockDevice::new();
    device.set_fail_open(true);
    let h = Harness::start(&config("max_reconnect_attempts: 2"), device);
    h.broker.accept();

    let device = h.device.clone();
    eventually("two attempts", || device.opens() == 2).await;

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.device.opens(), 2);
    assert_eq!(h.bridge.wireless().state(), LinkState::Disconnected);

    h.device.set_fail_open(false);
    assert_ok!(h.bridge.wireless().request_reconnect());

    let bus = h.bus.clone();
    eventually("online after request", || {
        bus.last_availability().as_deref() == Some("online")
    })
    .await;
    assert_eq!(h.device.opens(), 3);

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_bus_reconnect_cap_parks_until_shutdown() {
    let h = Harness::online(&config("max_reconnect_attempts: 2")).await;

    for _ in 0..3 {
        h.broker.drop_connection();
    }
    tokio::time::sleep(Duration::from_secs(10)).await;

    let bus_handle = h.bridge.bus();
    assert_eq!(bus_handle.state(), LinkState::Disconnected);
    let mut states = bus_handle.subscribe_state();
    states.borrow_and_update();

    // The broker is reachable again, but the link no longer polls it.
    h.broker.accept();
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(!states.has_changed().unwrap());
    assert_eq!(bus_handle.state(), LinkState::Disconnected);

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_requested_during_login_is_not_replayed() {
    let device = MockDevice::new();
    device.set_auth(Auth::Silent);
    let h = Harness::start(&config(""), device);
    h.broker.accept();

    let wireless = h.bridge.wireless();
    eventually("authenticating", || wireless.state() == LinkState::Authenticating).await;
    assert_ok!(wireless.request_reconnect());

    eventually("ready", || wireless.state() == LinkState::Ready).await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.device.opens(), 1);
    assert_eq!(wireless.state(), LinkState::Ready);

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unlimited_retries_by_default() {
    let device = MockDevice::new();
    device.set_fail_open(true);
    let h = Harness::start(&config(""), device);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(h.device.opens() >= 10, "opens: {}", h.device.opens());

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_optimistic_mode_keeps_rejected_echo() {
    let h = Harness::online(&config("")).await;
    h.device.reply("$EEP,WRITE,IDX,174,16", "$EEP,WRITE,IDX,174,16\n");
    h.device.reply("$EEP,WRITE,IDX,174,20", "$EEP,WRITE,FAIL\n");

    h.broker.deliver("set/user_limit", "16");
    let bus = h.bus.clone();
    eventually("first answer", || bus.published_on("easywallbox/message").len() == 1).await;
    h.broker.deliver("set/user_limit", "20");
    eventually("second answer", || bus.published_on("easywallbox/message").len() == 2).await;

    assert_eq!(
        h.bus.published_on("easywallbox/user_limit/state"),
        vec!["16".to_string(), "20".to_string()]
    );

    h.bridge.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_mode_reverts_rejected_echo() {
    let h = Harness::online(&config(r#"reconcile: "on_notification""#)).await;
    h.device.reply("$EEP,WRITE,IDX,174,16", "$EEP,WRITE,IDX,174,16\n");
    h.device.reply("$EEP,WRITE,IDX,174,20", "$EEP,WRITE,FAIL\n");

    h.broker.deliver("set/user_limit", "16");
    let bus = h.bus.clone();
    eventually("first answer", || bus.published_on("easywallbox/message").len() == 1).await;
    h.broker.deliver("set/user_limit", "20");
    eventually("revert", || {
        bus.published_on("easywallbox/user_limit/state").len() == 3
    })
    .await;

    assert_eq!(
        h.bus.published_on("easywallbox/user_limit/state"),
        vec!["16".to_string(), "20".to_string(), "16".to_string()]
    );

    h.bridge.shutdown().await;
}
