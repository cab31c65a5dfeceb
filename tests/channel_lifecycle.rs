//! Channel lifecycle against a scripted transport, on paused time

use fieldlink_core::config::ChannelConfig;
use fieldlink_core::core::links::{eml_channel, EmlChannel};
use fieldlink_core::core::protocol::EmlReading;
use fieldlink_core::core::session::{ChannelError, ChannelEvent};
use fieldlink_core::core::state_machine::ConnectionState;
use fieldlink_core::core::transport::{
    DeviceDescriptor, ScriptedControl, ScriptedTransport, TransportCapabilities, TransportKind,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{sleep, Instant};

fn device(id: &str) -> DeviceDescriptor {
    DeviceDescriptor::new(id, TransportKind::Serial)
}

fn reading(depth: u32) -> String {
    format!("F03,0073,ACTIVE,33000Hz,140,---,L,P,cm,{depth},mA,55,dB,-40\n")
}

async fn bound(config: &ChannelConfig, transport: ScriptedTransport) -> EmlChannel {
    let channel = eml_channel(config);
    channel.set_transport(Some(Box::new(transport))).await.unwrap();
    channel
}

async fn serial_channel() -> (EmlChannel, ScriptedControl) {
    let (transport, control) = ScriptedTransport::new(TransportKind::Serial);
    (bound(&ChannelConfig::default(), transport).await, control)
}

fn collect(channel: &EmlChannel) -> mpsc::UnboundedReceiver<EmlReading> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.subscribe(move |reading| {
        let _ = tx.send(reading.clone());
        Ok(())
    });
    rx
}

fn drain(events: &mut broadcast::Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

fn scheduled_delays(events: &[ChannelEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::ReconnectScheduled { delay, .. } => Some(delay.as_secs()),
            _ => None,
        })
        .collect()
}

async fn wait_for_state(channel: &EmlChannel, state: ConnectionState) {
    channel
        .state_changes()
        .wait_for(|s| *s == state)
        .await
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn backoff_follows_schedule() {
    let (channel, control) = serial_channel().await;
    let mut events = channel.events();
    control.fail_connects("gps-1", true);

    let start = Instant::now();
    channel.select_device(Some(device("gps-1"))).await.unwrap();
    sleep(Duration::from_secs(40)).await;

    let offsets: Vec<u64> = control
        .attempt_times("gps-1")
        .iter()
        .map(|t| t.duration_since(start).as_secs_f64().round() as u64)
        .collect();
    assert_eq!(offsets, [0, 1, 3, 7, 15, 25, 35]);

    let events = drain(&mut events);
    assert_eq!(scheduled_delays(&events), [1, 2, 4, 8, 10, 10, 10]);
    let attempts: Vec<u32> = events
        .iter()
        .filter_map(|e| match e {
            ChannelEvent::ReconnectScheduled { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2, 3, 4, 5, 6, 7]);
    assert_eq!(channel.current_state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn device_change_cancels_pending_reconnect() {
    let (channel, control) = serial_channel().await;
    control.fail_connects("gps-1", true);

    channel.select_device(Some(device("gps-1"))).await.unwrap();
    channel.select_device(Some(device("gps-2"))).await.unwrap();
    assert_eq!(channel.current_state(), ConnectionState::Connected);

    sleep(Duration::from_secs(30)).await;
    assert_eq!(control.connect_attempts("gps-1"), 1);
    assert_eq!(control.connect_attempts("gps-2"), 1);
    assert_eq!(channel.current_device(), Some(device("gps-2")));
}

#[tokio::test(start_paused = true)]
async fn reselecting_connected_device_is_a_noop() {
    let (channel, control) = serial_channel().await;
    let mut events = channel.events();

    channel.select_device(Some(device("gps-1"))).await.unwrap();
    drain(&mut events);
    channel.select_device(Some(device("gps-1"))).await.unwrap();

    assert_eq!(control.connect_attempts("gps-1"), 1);
    assert_eq!(control.disconnect_count(), 0);
    assert!(drain(&mut events).is_empty());
}

#[tokio::test(start_paused = true)]
async fn link_drop_reconnects_after_first_delay() {
    let (channel, control) = serial_channel().await;
    channel.select_device(Some(device("gps-1"))).await.unwrap();

    assert!(control.drop_link());
    wait_for_state(&channel, ConnectionState::Disconnected).await;

    sleep(Duration::from_millis(999)).await;
    assert_eq!(control.connect_attempts("gps-1"), 1);

    sleep(Duration::from_millis(2)).await;
    assert_eq!(control.connect_attempts("gps-1"), 2);
    assert_eq!(channel.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn backoff_survives_reselect_and_resets_on_new_device() {
    let (channel, control) = serial_channel().await;
    let mut events = channel.events();
    control.fail_connects("gps-1", true);
    control.fail_connects("gps-2", true);

    channel.select_device(Some(device("gps-1"))).await.unwrap();
    sleep(Duration::from_secs(4)).await;
    assert_eq!(scheduled_delays(&drain(&mut events)), [1, 2, 4]);

    // Same device again: the pending timer goes, the counter stays
    channel.select_device(Some(device("gps-1"))).await.unwrap();
    assert_eq!(scheduled_delays(&drain(&mut events)), [4]);

    channel.set_enabled(false).await.unwrap();
    channel.set_enabled(true).await.unwrap();
    assert_eq!(scheduled_delays(&drain(&mut events)), [4]);
    assert_eq!(control.connect_attempts("gps-1"), 5);

    channel.select_device(Some(device("gps-2"))).await.unwrap();
    let events = drain(&mut events);
    assert_eq!(scheduled_delays(&events), [1]);
    assert!(events.contains(&ChannelEvent::ReconnectScheduled {
        attempt: 1,
        delay: Duration::from_millis(1_000),
    }));
}

#[tokio::test(start_paused = true)]
async fn disable_clears_pending_reconnect() {
    let (channel, control) = serial_channel().await;
    control.fail_connects("gps-1", true);
    channel.select_device(Some(device("gps-1"))).await.unwrap();

    channel.set_enabled(false).await.unwrap();
    sleep(Duration::from_secs(30)).await;
    assert_eq!(control.connect_attempts("gps-1"), 1);

    control.fail_connects("gps-1", false);
    channel.set_enabled(true).await.unwrap();
    assert_eq!(control.connect_attempts("gps-1"), 2);
    assert_eq!(channel.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn transient_disconnects_keep_the_session() {
    let (transport, control) = ScriptedTransport::new(TransportKind::Listen);
    let transport = transport.with_capabilities(TransportCapabilities::LISTEN);
    let channel = bound(&ChannelConfig::default(), transport).await;
    let mut records = collect(&channel);
    let mut events = channel.events();

    channel
        .select_device(Some(DeviceDescriptor::new("listen:test", TransportKind::Listen)))
        .await
        .unwrap();
    let sink = control.current_sink().unwrap();

    for depth in [100, 200] {
        sink.data(reading(depth));
        sink.disconnected();
    }
    assert_eq!(records.recv().await.unwrap().depth, 100.0);
    assert_eq!(records.recv().await.unwrap().depth, 200.0);

    sleep(Duration::from_secs(10)).await;
    assert_eq!(channel.current_state(), ConnectionState::Connected);
    assert_eq!(control.connect_attempts("listen:test"), 1);
    assert!(scheduled_delays(&drain(&mut events)).is_empty());
}

#[tokio::test(start_paused = true)]
async fn events_from_previous_session_are_ignored() {
    let (channel, control) = serial_channel().await;
    let mut records = collect(&channel);

    channel.select_device(Some(device("gps-1"))).await.unwrap();
    let stale = control.current_sink().unwrap();
    channel.select_device(Some(device("gps-2"))).await.unwrap();

    stale.data(reading(111));
    stale.disconnected();
    assert!(control.push_data(reading(222)));

    assert_eq!(records.recv().await.unwrap().depth, 222.0);
    assert!(records.try_recv().is_err());
    assert_eq!(channel.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn failing_subscriber_does_not_block_others() {
    let (channel, control) = serial_channel().await;
    let mut events = channel.events();

    let failing = channel.subscribe(|_| Err("rejected".into()));
    let panicking = channel.subscribe(|_| panic!("handler bug"));
    let mut records = collect(&channel);

    channel.select_device(Some(device("gps-1"))).await.unwrap();
    assert!(control.push_data(reading(150)));
    assert_eq!(records.recv().await.unwrap().depth, 150.0);

    let failed: Vec<_> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            ChannelEvent::SubscriberFailed { subscription, .. } => Some(subscription),
            _ => None,
        })
        .collect();
    assert_eq!(failed, [failing.id(), panicking.id()]);

    assert!(failing.unsubscribe());
    assert!(panicking.unsubscribe());
    assert!(control.push_data(reading(160)));
    assert_eq!(records.recv().await.unwrap().depth, 160.0);
    assert!(!drain(&mut events)
        .iter()
        .any(|e| matches!(e, ChannelEvent::SubscriberFailed { .. })));
}

#[tokio::test(start_paused = true)]
async fn oversized_line_reports_overflow() {
    let config = ChannelConfig {
        line_buffer_cap: 16,
        ..ChannelConfig::default()
    };
    let (transport, control) = ScriptedTransport::new(TransportKind::Serial);
    let channel = bound(&config, transport).await;
    let mut events = channel.events();

    channel.select_device(Some(device("gps-1"))).await.unwrap();
    assert!(control.push_data(vec![b'x'; 40]));

    loop {
        match events.recv().await.unwrap() {
            ChannelEvent::BufferOverflow { dropped } => {
                assert_eq!(dropped, 24);
                break;
            }
            _ => continue,
        }
    }
}

#[tokio::test(start_paused = true)]
async fn send_requires_transport_and_link() {
    let channel = eml_channel(&ChannelConfig::default());
    assert!(matches!(
        channel.select_device(Some(device("gps-1"))).await,
        Err(ChannelError::Unsupported)
    ));
    assert!(matches!(
        channel.list_available_devices().await,
        Err(ChannelError::Unsupported)
    ));

    let (transport, control) = ScriptedTransport::new(TransportKind::Serial);
    control.set_devices(vec![device("gps-1")]);
    channel.set_transport(Some(Box::new(transport))).await.unwrap();
    assert_eq!(channel.list_available_devices().await.unwrap(), [device("gps-1")]);
    assert!(matches!(
        channel.send(b"ping").await,
        Err(ChannelError::NotConnected)
    ));

    channel.select_device(Some(device("gps-1"))).await.unwrap();
    channel.send(b"ping").await.unwrap();
    assert_eq!(control.sent(), [&b"ping"[..]]);

    let mut events = channel.events();
    control.fail_sends(true);
    assert!(matches!(
        channel.send(b"pong").await,
        Err(ChannelError::Transport(_))
    ));
    assert!(matches!(
        events.try_recv(),
        Ok(ChannelEvent::TransportError(_))
    ));
    assert_eq!(channel.current_state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn rebinding_moves_the_session() {
    let (channel, first) = serial_channel().await;
    channel.select_device(Some(device("gps-1"))).await.unwrap();

    let (transport, second) = ScriptedTransport::new(TransportKind::Ble);
    channel.set_transport(Some(Box::new(transport))).await.unwrap();

    assert_eq!(first.disconnect_count(), 1);
    assert!(!first.is_connected());
    assert_eq!(second.connected_device(), Some(device("gps-1")));
    assert_eq!(channel.current_state(), ConnectionState::Connected);

    channel.set_transport(None).await.unwrap();
    assert_eq!(second.disconnect_count(), 1);
    assert_eq!(channel.current_state(), ConnectionState::Disconnected);
    channel.shutdown().await.unwrap();
}
