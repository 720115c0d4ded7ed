//! Full-stack tests over a scripted in-memory device: the fake sits
//! behind the `Transport` seam, decodes every frame the stack writes,
//! and queues the bytes a real transceiver would send back.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use antlink::message::{
    self, Message, CHANNEL_IN_WRONG_STATE, MESG_ASSIGN_CHANNEL_ID, MESG_CAPABILITIES_ID,
    MESG_CHANNEL_ID_ID, MESG_CHANNEL_MESG_PERIOD_ID, MESG_CHANNEL_RADIO_FREQ_ID,
    MESG_CLOSE_CHANNEL_ID, MESG_ENABLE_EXT_RX_MESGS_ID, MESG_EVENT_ID, MESG_NETWORK_KEY_ID,
    MESG_OPEN_CHANNEL_ID, MESG_OPEN_RX_SCAN_MODE_ID, MESG_REQUEST, MESG_RESET,
    MESG_RESPONSE_EVENT_ID, MESG_STARTUP_MESG_ID, MESG_UNASSIGN_CHANNEL_ID, RESPONSE_NO_ERROR,
};
use antlink::scanner::{ClientId, CommonData, ScanHandler, Scanner};
use antlink::{
    ChannelHandler, ChannelState, Config, Node, ProtocolError, Pump, Transport, TransportError,
};

const TEST_KEY: [u8; 8] = [0xB9, 0xA5, 0x21, 0xFB, 0xBD, 0x72, 0xC3, 0x45];

#[derive(Default)]
struct DeviceState {
    incoming: VecDeque<u8>,
    writes: Vec<Message>,
    reject: Option<(u8, u8)>,
    silent: bool,
}

/// Scripted ANT transceiver. Writes are decoded and acknowledged the way
/// the real stick acknowledges them; tests can inject arbitrary inbound
/// frames and script rejections.
#[derive(Default)]
struct FakeDevice {
    state: Mutex<DeviceState>,
}

impl FakeDevice {
    fn open() -> Arc<FakeDevice> {
        Arc::new(FakeDevice::default())
    }

    /// Queue a frame for the host to read.
    fn push_frame(&self, mesg: &Message) {
        self.state.lock().unwrap().incoming.extend(mesg.encode());
    }

    /// Answer `msg_id` commands with `code` instead of no-error.
    fn reject(&self, msg_id: u8, code: u8) {
        self.state.lock().unwrap().reject = Some((msg_id, code));
    }

    /// Swallow all commands without acknowledging them.
    fn go_silent(&self) {
        self.state.lock().unwrap().silent = true;
    }

    fn written_ids(&self) -> Vec<u8> {
        self.state.lock().unwrap().writes.iter().map(|m| m.id).collect()
    }

    fn respond(state: &mut DeviceState, mesg: &Message) {
        if state.silent {
            return;
        }
        let code = match state.reject {
            Some((id, code)) if id == mesg.id => code,
            _ => RESPONSE_NO_ERROR,
        };
        let channel = mesg.data.first().copied().unwrap_or(0);
        let reply = match mesg.id {
            MESG_RESET => Message::new(MESG_STARTUP_MESG_ID, &[0x20]),
            MESG_REQUEST => match mesg.data.get(1) {
                Some(&MESG_CAPABILITIES_ID) => {
                    Message::new(MESG_CAPABILITIES_ID, &[8, 8, 0, 0, 0, 0])
                }
                Some(&MESG_CHANNEL_ID_ID) => {
                    Message::new(MESG_CHANNEL_ID_ID, &[channel, 0x34, 0x12, 0x78, 0x01])
                }
                _ => return,
            },
            id => Message::new(MESG_RESPONSE_EVENT_ID, &[channel, id, code]),
        };
        state.incoming.extend(reply.encode());
    }
}

impl Transport for FakeDevice {
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let n = {
            let mut state = self.state.lock().unwrap();
            let n = state.incoming.len().min(buf.len());
            for slot in buf.iter_mut().take(n) {
                *slot = state.incoming.pop_front().unwrap();
            }
            n
        };
        if n == 0 {
            thread::sleep(timeout.min(Duration::from_millis(5)));
            return Err(TransportError::Timeout);
        }
        Ok(n)
    }

    fn write(&self, data: &[u8]) -> Result<usize, TransportError> {
        let mut state = self.state.lock().unwrap();
        let (mesg, _) = message::decode(data).expect("host wrote a malformed frame");
        state.writes.push(mesg.clone());
        FakeDevice::respond(&mut state, &mesg);
        Ok(data.len())
    }

    fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

fn node_over(device: &Arc<FakeDevice>) -> Node {
    let (pump, frames) = Pump::new(Box::new(device.clone()));
    let mut node = Node::new(pump, frames);
    node.set_response_timeout(Duration::from_millis(500));
    node
}

/// Handler recording every broadcast payload and event code it sees.
#[derive(Clone, Default)]
struct Recorder {
    broadcasts: Arc<Mutex<Vec<Vec<u8>>>>,
    events: Arc<Mutex<Vec<u8>>>,
}

impl ChannelHandler for Recorder {
    fn on_broadcast(&mut self, payload: &[u8]) {
        self.broadcasts.lock().unwrap().push(payload.to_vec());
    }

    fn on_event(&mut self, code: message::ChannelResponseCode) {
        if let message::ChannelResponseCode::Other(code) = code {
            self.events.lock().unwrap().push(code);
        } else {
            self.events.lock().unwrap().push(0);
        }
    }
}

fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn bring_up_and_open_issue_commands_in_order() {
    let device = FakeDevice::open();
    let node = node_over(&device);

    node.reset_system().unwrap();
    node.set_network_key(0, &TEST_KEY).unwrap();

    let config = Config::new()
        .device_id(0x1234)
        .device_type(0x78)
        .transmission_type(1)
        .frequency(0x39)
        .period(8070);
    let mut channel = node.channel(config).unwrap();
    assert_eq!(channel.number(), 0);
    channel.open(Box::new(Recorder::default())).unwrap();
    assert_eq!(channel.state(), ChannelState::Open);

    assert_eq!(
        device.written_ids(),
        vec![
            MESG_RESET,
            MESG_NETWORK_KEY_ID,
            MESG_ASSIGN_CHANNEL_ID,
            MESG_CHANNEL_ID_ID,
            MESG_CHANNEL_MESG_PERIOD_ID,
            MESG_CHANNEL_RADIO_FREQ_ID,
            MESG_OPEN_CHANNEL_ID,
        ]
    );
    // The id command carried the device identity.
    let state = device.state.lock().unwrap();
    let set_id = state.writes.iter().find(|m| m.id == MESG_CHANNEL_ID_ID).unwrap();
    assert_eq!(set_id.data[..], [0, 0x34, 0x12, 0x78, 1]);
    drop(state);

    channel.close().unwrap();
    node.stop().unwrap();
}

#[test]
fn rejected_set_id_aborts_the_open_sequence() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    node.reset_system().unwrap();
    node.set_network_key(0, &TEST_KEY).unwrap();
    device.reject(MESG_CHANNEL_ID_ID, CHANNEL_IN_WRONG_STATE);

    let mut channel = node.channel(Config::new().device_id(0x1234)).unwrap();
    match channel.open(Box::new(Recorder::default())) {
        Err(ProtocolError::DeviceRejected(code)) => assert_eq!(code, CHANNEL_IN_WRONG_STATE),
        other => panic!("expected rejection, got {:?}", other.map(|_| ())),
    }
    // Assign was acknowledged, nothing past the rejected set-id went out.
    assert_eq!(channel.state(), ChannelState::Assigned);
    let ids = device.written_ids();
    assert!(ids.contains(&MESG_ASSIGN_CHANNEL_ID));
    assert!(!ids.contains(&MESG_CHANNEL_MESG_PERIOD_ID));
    assert!(!ids.contains(&MESG_CHANNEL_RADIO_FREQ_ID));
    assert!(!ids.contains(&MESG_OPEN_CHANNEL_ID));
    node.stop().unwrap();
}

#[test]
fn opening_without_a_network_key_fails_locally() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    let mut channel = node.channel(Config::new()).unwrap();
    match channel.open(Box::new(Recorder::default())) {
        Err(ProtocolError::NetworkNotKeyed(0)) => {}
        other => panic!("expected missing key error, got {:?}", other.map(|_| ())),
    }
    assert!(device.written_ids().is_empty());
    node.stop().unwrap();
}

#[test]
fn concurrent_requests_never_swap_responses() {
    let device = FakeDevice::open();
    let node = Arc::new(node_over(&device));

    let mut workers = Vec::new();
    for _ in 0..4 {
        let caps_node = node.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..10 {
                let reply = caps_node.request_message(0, MESG_CAPABILITIES_ID).unwrap();
                assert_eq!(reply[..2], [8, 8]);
            }
        }));
        let id_node = node.clone();
        workers.push(thread::spawn(move || {
            for _ in 0..10 {
                let reply = id_node.request_message(0, MESG_CHANNEL_ID_ID).unwrap();
                assert_eq!(reply[1..], [0x34, 0x12, 0x78, 0x01]);
            }
        }));
    }
    for worker in workers {
        worker.join().unwrap();
    }
    node.stop().unwrap();
}

#[test]
fn broadcasts_reach_the_handler_in_arrival_order() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    node.reset_system().unwrap();
    node.set_network_key(0, &TEST_KEY).unwrap();

    let recorder = Recorder::default();
    let broadcasts = recorder.broadcasts.clone();
    let mut channel = node.channel(Config::new().device_id(1)).unwrap();
    channel.open(Box::new(recorder)).unwrap();

    for seq in 0..5u8 {
        device.push_frame(&Message::new(
            message::MESG_BROADCAST_DATA_ID,
            &[0, seq, 0, 0, 0, 0, 0, 0, 72],
        ));
    }
    assert!(wait_until(Duration::from_secs(2), || broadcasts
        .lock()
        .unwrap()
        .len()
        == 5));
    let received = broadcasts.lock().unwrap();
    for (seq, payload) in received.iter().enumerate() {
        assert_eq!(payload[0], seq as u8);
    }
    drop(received);
    node.stop().unwrap();
}

#[test]
fn channel_events_reach_the_handler() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    node.reset_system().unwrap();
    node.set_network_key(0, &TEST_KEY).unwrap();

    let recorder = Recorder::default();
    let events = recorder.events.clone();
    let mut channel = node.channel(Config::new().device_id(1)).unwrap();
    channel.open(Box::new(recorder)).unwrap();

    // Unsolicited rx-fail event on the open channel.
    device.push_frame(&Message::new(
        MESG_RESPONSE_EVENT_ID,
        &[0, MESG_EVENT_ID, 0x02],
    ));
    assert!(wait_until(Duration::from_secs(2), || !events
        .lock()
        .unwrap()
        .is_empty()));
    node.stop().unwrap();
}

#[test]
fn scanner_reports_each_client_once() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    node.reset_system().unwrap();
    node.set_network_key(0, &TEST_KEY).unwrap();

    #[derive(Clone, Default)]
    struct Dedup {
        found: Arc<Mutex<Vec<ClientId>>>,
        updates: Arc<Mutex<usize>>,
    }
    impl ScanHandler for Dedup {
        fn on_found(&mut self, client: &ClientId) {
            self.found.lock().unwrap().push(*client);
        }
        fn on_update(&mut self, _client: &ClientId, _common: &CommonData) {
            *self.updates.lock().unwrap() += 1;
        }
    }

    let handler = Dedup::default();
    let found = handler.found.clone();
    let updates = handler.updates.clone();
    let mut scanner = Scanner::open(&node, handler).unwrap();
    assert_eq!(
        device.written_ids(),
        vec![
            MESG_RESET,
            MESG_NETWORK_KEY_ID,
            MESG_ASSIGN_CHANNEL_ID,
            MESG_CHANNEL_ID_ID,
            MESG_CHANNEL_RADIO_FREQ_ID,
            MESG_ENABLE_EXT_RX_MESGS_ID,
            MESG_OPEN_RX_SCAN_MODE_ID,
        ]
    );

    let broadcast = |device_id: u16| {
        let mut data = vec![0u8, 0x04, 0xFF, 0xFF, 0xFF, 0x00, 0x04, 10, 72];
        data.extend_from_slice(&[0x80, (device_id & 0xFF) as u8, (device_id >> 8) as u8, 0x78, 1]);
        Message::new(message::MESG_BROADCAST_DATA_ID, &data)
    };
    device.push_frame(&broadcast(0x1234));
    device.push_frame(&broadcast(0x1234));
    device.push_frame(&broadcast(0x4321));

    assert!(wait_until(Duration::from_secs(2), || *updates.lock().unwrap() == 3));
    let found = found.lock().unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].device_id, 0x1234);
    assert_eq!(found[1].device_id, 0x4321);
    drop(found);

    scanner.close().unwrap();
    node.stop().unwrap();
}

#[test]
fn close_sends_close_and_unassign_then_frees_the_channel() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    node.reset_system().unwrap();
    node.set_network_key(0, &TEST_KEY).unwrap();

    let mut channel = node.channel(Config::new().device_id(1)).unwrap();
    channel.open(Box::new(Recorder::default())).unwrap();
    channel.close().unwrap();
    assert_eq!(channel.state(), ChannelState::Closed);
    let ids = device.written_ids();
    assert!(ids.contains(&MESG_CLOSE_CHANNEL_ID));
    assert!(ids.contains(&MESG_UNASSIGN_CHANNEL_ID));

    // The number returned to the pool.
    let next = node.channel(Config::new().device_id(2)).unwrap();
    assert_eq!(next.number(), 0);
    drop(next);
    node.stop().unwrap();
}

#[test]
fn channel_pool_is_bounded() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    let channels: Vec<_> = (0..8).map(|_| node.channel(Config::new()).unwrap()).collect();
    assert_eq!(channels.last().unwrap().number(), 7);
    match node.channel(Config::new()) {
        Err(ProtocolError::NoFreeChannel) => {}
        other => panic!("expected pool exhaustion, got {:?}", other.map(|c| c.number())),
    }
    drop(channels);
    node.stop().unwrap();
}

#[test]
fn stop_cancels_a_blocked_request() {
    let device = FakeDevice::open();
    let node = Arc::new(node_over(&device));
    device.go_silent();

    let waiter_node = node.clone();
    let waiter = thread::spawn(move || {
        let start = Instant::now();
        let result = waiter_node.request_message(0, MESG_CAPABILITIES_ID);
        (result, start.elapsed())
    });
    // Give the request time to park, then tear the engine down under it.
    thread::sleep(Duration::from_millis(100));
    node.stop().unwrap();

    let (result, elapsed) = waiter.join().unwrap();
    match result {
        Err(ProtocolError::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
    // Cancelled promptly, well inside the response timeout.
    assert!(elapsed < Duration::from_millis(500));
}

#[test]
fn commands_after_stop_are_cancelled() {
    let device = FakeDevice::open();
    let node = node_over(&device);
    node.stop().unwrap();
    match node.request_message(0, MESG_CAPABILITIES_ID) {
        Err(ProtocolError::Cancelled) => {}
        other => panic!("expected cancellation, got {:?}", other.map(|_| ())),
    }
    // stop() is idempotent.
    node.stop().unwrap();
}
