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

//! Entity event mirroring: executors, nodes and handles observed from
//! the server side.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use ntest::timeout;

use blackbox2::{protocol::HandleKind, Client, NullStatProvider};

mod support;

use support::{client_config, next_port, start_server, wait_for};

#[test]
#[timeout(30000)]
fn executor_node_spans_reach_the_proxy() {
    let port = next_port();
    let server = start_server(port);
    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));

    let node = client.create_node_stub("planner").expect("node stub");
    let executor = client.create_executor_stub(4).expect("executor stub");
    wait_for("node to attach", || node.instance_id() > 0);
    wait_for("executor to attach", || executor.instance_id() > 0);
    wait_for("proxies under the process", || {
        server
            .processes()
            .first()
            .map(|p| p.nodes().len() == 1 && p.executors().len() == 1)
            .unwrap_or(false)
    });

    let process = server.processes().remove(0);
    let node_proxy = process.nodes().remove(0);
    let executor_proxy = process.executors().remove(0);
    assert_eq!(node_proxy.name(), "planner");
    assert_eq!(executor_proxy.thread_pool_size(), 4);
    assert!(!executor_proxy.is_running());

    // node attachment, run spans and task spans all mirror across
    let attached = Arc::new(AtomicUsize::new(0));
    let attached_in_signal = Arc::clone(&attached);
    let on_attached = executor_proxy.on_node_attached();
    let _sub = on_attached.subscribe(move |_name| {
        attached_in_signal.fetch_add(1, Ordering::SeqCst);
    });
    let tasks = Arc::new(Mutex::new(Vec::new()));
    let tasks_in_signal = Arc::clone(&tasks);
    let on_task_begin = executor_proxy.on_task_begin();
    let _task_sub = on_task_begin.subscribe(move |task| {
        tasks_in_signal.lock().unwrap().push(task.task_id);
    });

    executor.attach_node(&node);
    wait_for("node name on the executor proxy", || {
        executor_proxy.attached_nodes() == vec![String::from("planner")]
    });
    wait_for("attach signal", || attached.load(Ordering::SeqCst) == 1);

    executor.run_begin();
    wait_for("running flag", || executor_proxy.is_running());
    executor.task_begin(42);
    wait_for("task span", || tasks.lock().unwrap().contains(&42));
    executor.task_end(42);
    executor.run_end();
    wait_for("run end", || !executor_proxy.is_running());

    // detaching removes the name for real
    executor.detach_node(&node);
    wait_for("node name removed", || executor_proxy.attached_nodes().is_empty());

    node.attach();
    wait_for("node attached flag", || node_proxy.is_executor_attached());
    node.detach();
    wait_for("node detached flag", || !node_proxy.is_executor_attached());

    server.stop();
}

#[test]
#[timeout(30000)]
fn handle_under_node_mirrors_enable_state() {
    let port = next_port();
    let server = start_server(port);
    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));

    let node = client.create_node_stub("io").expect("node stub");
    wait_for("node to attach", || node.instance_id() > 0);

    let mut mapping = BTreeMap::new();
    mapping.insert(String::from("pose"), String::from("chan-1"));
    let handle = node
        .create_handle_stub(HandleKind::Reader, "pose", &mapping, None)
        .expect("handle stub");
    wait_for("handle to attach", || handle.instance_id() > 0);
    wait_for("handle proxy under node", || {
        server
            .processes()
            .first()
            .and_then(|p| p.nodes().first().map(|n| n.handles().len() == 1))
            .unwrap_or(false)
    });

    let node_proxy = server.processes().remove(0).nodes().remove(0);
    let handle_proxy = node_proxy.handles().remove(0);
    assert_eq!(handle_proxy.kind(), HandleKind::Reader);
    assert_eq!(handle_proxy.key(), "pose");
    assert_eq!(
        handle_proxy.mapping_channels().get("pose").map(String::as_str),
        Some("chan-1")
    );
    assert!(handle_proxy.is_enabled());

    let disabled = Arc::new(AtomicUsize::new(0));
    let disabled_in_signal = Arc::clone(&disabled);
    let on_disabled = handle_proxy.on_disabled();
    let _sub = on_disabled.subscribe(move |_| {
        disabled_in_signal.fetch_add(1, Ordering::SeqCst);
    });

    handle.disable();
    wait_for("disable to mirror", || !handle_proxy.is_enabled());
    wait_for("disable signal", || disabled.load(Ordering::SeqCst) == 1);
    handle.enable();
    wait_for("enable to mirror", || handle_proxy.is_enabled());

    server.stop();
}

#[test]
#[timeout(30000)]
fn dropping_a_child_stub_removes_only_its_proxy() {
    let port = next_port();
    let server = start_server(port);
    let client = Client::with_config(client_config(port), Arc::new(NullStatProvider));

    let node = client.create_node_stub("short-lived").expect("node stub");
    wait_for("node to attach", || node.instance_id() > 0);
    wait_for("node proxy", || {
        server.processes().first().map(|p| p.nodes().len() == 1).unwrap_or(false)
    });

    let process = server.processes().remove(0);
    let removed = Arc::new(AtomicUsize::new(0));
    let removed_in_signal = Arc::clone(&removed);
    let on_removed = process.on_node_removed();
    let _sub = on_removed.subscribe(move |_| {
        removed_in_signal.fetch_add(1, Ordering::SeqCst);
    });

    drop(node);
    wait_for("node proxy removal", || process.nodes().is_empty());
    assert_eq!(removed.load(Ordering::SeqCst), 1);
    // the process itself is untouched
    assert_eq!(server.processes().len(), 1);
    assert!(client.instance_id() > 0);

    server.stop();
}
