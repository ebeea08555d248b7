// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! End-to-end attach scenarios: a real client role talking to a real
//! server role over the in-process fabric.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};

use ntest::timeout;

use blackbox2::{
    protocol::{message_fields, Status},
    ChannelConfig, Client, MessageInfo, NullStatProvider, Stat,
};

mod support;

use support::{client_config, next_port, start_server, wait_for, MapStatProvider};

#[test]
#[timeout(30000)]
fn happy_process_attach() {
    let port = next_port();
    let server = start_server(port);

    let added = Arc::new(AtomicUsize::new(0));
    let added_in_signal = Arc::clone(&added);
    let added_signal = server.on_process_added();
    let _sub = added_signal.subscribe(move |_proxy| {
        added_in_signal.fetch_add(1, Ordering::SeqCst);
    });

    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));
    assert!(client.is_enabled());

    wait_for("process to attach", || client.instance_id() > 0);
    wait_for("process proxy to appear", || server.processes().len() == 1);
    wait_for("added signal", || added.load(Ordering::SeqCst) == 1);

    let proxy = server.processes().remove(0);
    assert!(proxy.is_connected());
    assert!(proxy.is_activated());
    assert_eq!(proxy.pid(), std::process::id() as i32);
    assert!(!proxy.working_directory().is_empty());
    assert!(proxy.startup_time() > std::time::UNIX_EPOCH);

    drop(client);
    wait_for("process proxy to go", || server.processes().is_empty());
    server.stop();
}

#[test]
#[timeout(30000)]
fn instance_id_change_is_signaled_once_per_attach() {
    let port = next_port();
    let server = start_server(port);

    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));
    let ids = Arc::new(Mutex::new(Vec::new()));
    let ids_in_signal = Arc::clone(&ids);
    let signal = client.on_instance_id_changed().expect("enabled client");
    let _sub = signal.subscribe(move |id| {
        ids_in_signal.lock().unwrap().push(*id);
    });

    wait_for("process to attach", || client.instance_id() > 0);
    let seen = ids.lock().unwrap().clone();
    // the subscription may race the first emission, but there must
    // never be more than one non-zero emission for a single attach
    assert!(seen.iter().filter(|id| **id > 0).count() <= 1);

    server.stop();
}

#[test]
#[timeout(30000)]
fn deferred_child_attach_links_channel_under_process() {
    let port = next_port();
    let server = start_server(port);

    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));
    // create the channel immediately: its attach has to wait for the
    // process to get its instance id, then carry that id upward
    let mut config = ChannelConfig::default();
    config.properties.insert(String::from("id"), String::from("chan-7"));
    config.properties.insert(String::from("type"), String::from("shm"));
    config.properties.insert(String::from("dir"), String::from("in"));
    let channel = client.create_channel_stub(&config, None).expect("channel stub");

    wait_for("channel to attach", || channel.instance_id() > 0);
    wait_for("channel proxy under process", || {
        server.processes().first().map(|p| p.channels().len()).unwrap_or(0) == 1
    });

    let process = server.processes().remove(0);
    let channel_proxy = process.channels().remove(0);
    assert_eq!(channel_proxy.id(), "chan-7");
    assert_eq!(channel_proxy.kind(), "shm");
    assert_eq!(channel_proxy.config().get("id").map(String::as_str), Some("chan-7"));

    server.stop();
}

#[test]
#[timeout(30000)]
fn reconnect_after_server_side_disconnect() {
    let port = next_port();
    let server = start_server(port);

    let removed = Arc::new(AtomicUsize::new(0));
    let removed_in_signal = Arc::clone(&removed);
    let removed_signal = server.on_process_removed();
    let _sub = removed_signal.subscribe(move |_proxy| {
        removed_in_signal.fetch_add(1, Ordering::SeqCst);
    });

    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));
    wait_for("first attach", || client.instance_id() > 0);
    let first_id = client.instance_id();

    // watch the client observe the drop before it re-attaches
    let saw_zero = Arc::new(AtomicU64::new(0));
    let saw_zero_in_signal = Arc::clone(&saw_zero);
    let signal = client.on_instance_id_changed().expect("enabled client");
    let _id_sub = signal.subscribe(move |id| {
        if *id == 0 {
            saw_zero_in_signal.fetch_add(1, Ordering::SeqCst);
        }
    });

    server.processes().remove(0).disconnect();

    wait_for("instance id reset", || saw_zero.load(Ordering::SeqCst) > 0);
    wait_for("re-attach", || {
        let id = client.instance_id();
        id > 0 && id != first_id
    });
    wait_for("fresh process proxy", || {
        server.processes().first().map(|p| p.is_connected()).unwrap_or(false)
    });
    wait_for("removed signal", || removed.load(Ordering::SeqCst) == 1);

    server.stop();
}

#[test]
#[timeout(30000)]
fn activation_gates_entity_traffic_end_to_end() {
    let port = next_port();
    let server = start_server(port);

    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));
    let config = ChannelConfig::default();
    let channel = client.create_channel_stub(&config, None).expect("channel stub");
    wait_for("channel to attach", || channel.instance_id() > 0);
    wait_for("channel proxy", || {
        server.processes().first().map(|p| p.channels().len()).unwrap_or(0) == 1
    });

    let process = server.processes().remove(0);
    let channel_proxy = process.channels().remove(0);
    channel_proxy.set_message_fields(
        message_fields::DEFAULT | message_fields::PAYLOAD_AND_SERIALIZE_TYPE,
    );

    let seen = Arc::new(AtomicUsize::new(0));
    let seen_in_signal = Arc::clone(&seen);
    let on_message = channel_proxy.on_message();
    let _sub = on_message.subscribe(move |_message| {
        seen_in_signal.fetch_add(1, Ordering::SeqCst);
    });

    // deactivate through the process proxy: the cascade flips the
    // channel stub's gate, and sends start failing
    process.set_activation(false);
    wait_for("activation to reach the stub", || {
        !channel.send_message(b"dropped", "raw", &MessageInfo::default())
    });
    let dropped_count = seen.load(Ordering::SeqCst);

    process.set_activation(true);
    wait_for("reactivation to reach the stub", || {
        channel.send_message(b"mirrored", "raw", &MessageInfo::default())
    });
    wait_for("mirrored message", || seen.load(Ordering::SeqCst) > dropped_count);

    server.stop();
}

#[test]
#[timeout(30000)]
fn key_stat_request_round_trip() {
    let port = next_port();
    let server = start_server(port);

    let mut stat = Stat::default();
    stat.rx.rx_packets = 17;
    stat.tx.tx_bytes = 4096;
    let provider = MapStatProvider::new(vec![("pose", stat)]);

    let client = Client::with_config(client_config(port), Arc::new(provider));
    wait_for("process to attach", || client.instance_id() > 0);
    wait_for("process proxy", || !server.processes().is_empty());
    let process = server.processes().remove(0);

    let answer: Arc<Mutex<Option<(Status, Option<Stat>)>>> = Arc::new(Mutex::new(None));
    let answer_in_cb = Arc::clone(&answer);
    assert!(process.get_key_stat("pose", move |status, stat| {
        *answer_in_cb.lock().unwrap() = Some((status, stat));
    }));
    wait_for("stat answer", || answer.lock().unwrap().is_some());
    let (status, got) = answer.lock().unwrap().take().unwrap();
    assert_eq!(status, Status::Ok);
    let got = got.expect("a stat block");
    assert_eq!(got.rx.rx_packets, 17);
    assert_eq!(got.tx.tx_bytes, 4096);

    // unknown keys surface as InvalidParameter with no block
    let answer_in_cb = Arc::clone(&answer);
    assert!(process.get_key_stat("no-such-key", move |status, stat| {
        *answer_in_cb.lock().unwrap() = Some((status, stat));
    }));
    wait_for("miss answer", || answer.lock().unwrap().is_some());
    let (status, got) = answer.lock().unwrap().take().unwrap();
    assert_eq!(status, Status::InvalidParameter);
    assert!(got.is_none());

    server.stop();
}

#[test]
#[timeout(30000)]
fn recorder_control_round_trip() {
    let port = next_port();
    let server = start_server(port);

    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));
    wait_for("process to attach", || client.instance_id() > 0);
    wait_for("process proxy", || !server.processes().is_empty());
    let process = server.processes().remove(0);

    assert!(!client.is_recorder_started());
    assert!(process.start_local_recorder());
    wait_for("recorder to start", || client.is_recorder_started());
    assert!(process.stop_local_recorder());
    wait_for("recorder to stop", || !client.is_recorder_started());

    assert!(process.start_local_player());
    wait_for("player to start", || client.is_player_started());
    assert!(process.stop_local_player());
    wait_for("player to stop", || !client.is_player_started());

    server.stop();
}

#[test]
#[timeout(30000)]
fn injected_message_reaches_the_stub_handler() {
    let port = next_port();
    let server = start_server(port);

    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));
    let received = Arc::new(Mutex::new(Vec::new()));
    let received_in_handler = Arc::clone(&received);
    let channel = client
        .create_channel_stub(
            &ChannelConfig::default(),
            Some(Arc::new(move |message| {
                received_in_handler.lock().unwrap().push(message);
            })),
        )
        .expect("channel stub");
    wait_for("channel to attach", || channel.instance_id() > 0);
    wait_for("channel proxy", || {
        server.processes().first().map(|p| p.channels().len()).unwrap_or(0) == 1
    });
    let channel_proxy = server.processes().remove(0).channels().remove(0);

    let message = blackbox2::protocol::Message {
        payload: Some(b"replay".to_vec()),
        serialize_type: Some(String::from("raw")),
        ..Default::default()
    };
    assert_eq!(channel_proxy.inject_message(message), Status::Ok);
    wait_for("injected message", || !received.lock().unwrap().is_empty());
    let got = received.lock().unwrap().remove(0);
    assert_eq!(got.payload.as_deref(), Some(b"replay".as_slice()));

    // a message without payload is refused before it ever leaves
    assert_eq!(
        channel_proxy.inject_message(blackbox2::protocol::Message::default()),
        Status::InvalidParameter
    );

    server.stop();
}
