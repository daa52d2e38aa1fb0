// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Fork, copy-on-write and IPC working together across emulated environments
//! INTENT: A forked child can diverge from its parent and hand pages back over IPC
//! DEPS: nexus-fork, nexus-ipc, nexus-sim
//! TESTS: Child sends its private copy to the parent; parent pushes a page to a fresh child;
//!   client finds a server by role and exchanges requests; per-process send policy

use std::thread;

use nexus_abi::{EnvType, PageFlags, Spawned, Syscalls, ENV_SELF, PAGE_SIZE, UTEXT};
use nexus_e2e::{boot, read, resume_child, write};
use nexus_ipc::{IpcError, Page, Retry};
use nexus_sim::SimKernel;

const DATA: usize = UTEXT;
const INBOX: usize = UTEXT + 16 * PAGE_SIZE;

#[test]
fn child_returns_private_copy_over_ipc() {
    let kernel = SimKernel::new();
    let mut parent = boot(&kernel, EnvType::User).unwrap();
    parent.kernel().page_alloc(ENV_SELF, DATA, PageFlags::URW).unwrap();
    write(&parent, DATA, b"from parent").unwrap();

    let Spawned::Parent(id) = parent.fork().unwrap() else {
        panic!("parent must see the child id");
    };
    let child = resume_child(&kernel, &parent, id).unwrap();
    let parent_id = parent.this_env();

    let worker = thread::spawn(move || {
        write(&child, DATA, b"from child!").unwrap();
        child.ipc_send(parent_id, 0xc0de, Some(Page::new(DATA, PageFlags::UR))).unwrap();
    });
    let msg = parent.ipc_recv(Some(INBOX)).unwrap();
    worker.join().unwrap();

    assert_eq!(msg.value, 0xc0de);
    assert_eq!(msg.from, id);
    assert_eq!(msg.perm, PageFlags::UR);
    assert_eq!(read(&parent, INBOX, 11).unwrap(), b"from child!");
    assert_eq!(read(&parent, DATA, 11).unwrap(), b"from parent");
}

#[test]
fn child_receives_with_its_own_identity() {
    let kernel = SimKernel::new();
    let mut parent = boot(&kernel, EnvType::User).unwrap();
    parent.kernel().page_alloc(ENV_SELF, DATA, PageFlags::URW).unwrap();

    let Spawned::Parent(id) = parent.fork().unwrap() else {
        panic!("parent must see the child id");
    };
    let child = resume_child(&kernel, &parent, id).unwrap();
    assert_eq!(child.this_env(), id);

    let waiter = thread::spawn(move || {
        let msg = child.ipc_recv(Some(INBOX)).unwrap();
        (msg, read(&child, INBOX, 4).unwrap())
    });
    parent.kernel().page_alloc(ENV_SELF, INBOX, PageFlags::URW).unwrap();
    write(&parent, INBOX, b"ping").unwrap();
    parent.ipc_send(id, 1, Some(Page::new(INBOX, PageFlags::URW))).unwrap();
    let (msg, bytes) = waiter.join().unwrap();

    assert_eq!(msg.from, parent.this_env());
    assert_eq!(msg.perm, PageFlags::URW);
    assert_eq!(bytes, b"ping");
}

#[test]
fn client_finds_server_by_role() {
    const REQUESTS: u32 = 3;

    let kernel = SimKernel::new();
    let client = boot(&kernel, EnvType::User).unwrap();
    let server = boot(&kernel, EnvType::Fs).unwrap();

    let service = thread::spawn(move || {
        for _ in 0..REQUESTS {
            let req = server.ipc_recv(None).unwrap();
            server.ipc_send(req.from, req.value + 1, None).unwrap();
        }
    });

    let fs = client.find_env(EnvType::Fs).expect("fs server is running");
    for value in 0..REQUESTS {
        client.ipc_send(fs, value * 10, None).unwrap();
        let reply = client.ipc_recv(None).unwrap();
        assert_eq!(reply.from, fs);
        assert_eq!(reply.value, value * 10 + 1);
    }
    service.join().unwrap();
    assert_eq!(client.find_env(EnvType::Ns), None);
}

#[test]
fn process_send_policy_is_configurable() {
    let kernel = SimKernel::new();
    let sender = boot(&kernel, EnvType::User).unwrap().with_send_retry(Retry::Attempts(2));
    let idle = boot(&kernel, EnvType::User).unwrap();

    let err = sender.ipc_send(idle.this_env(), 1, None).unwrap_err();
    assert_eq!(err, IpcError::Exhausted { attempts: 2 });
    assert_eq!(sender.kernel().yield_count(), 1);
}
