#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

use clinicd::api::Services;
use clinicd::auth::StaticTokenVerifier;
use clinicd::engine::Scheduler;
use clinicd::gateway::Gateway;
use clinicd::model::EntityKind;
use clinicd::propagation::{PropagationHandle, Propagator};
use clinicd::rooms::RoomRegistry;
use clinicd::server;
use clinicd::store::DocumentStore;

pub struct TestServer {
    pub addr: SocketAddr,
    pub store: Arc<DocumentStore>,
    pub rooms: Arc<RoomRegistry>,
    pub propagation: PropagationHandle,
    pub shutdown: CancellationToken,
}

/// Users: `root` (privileged, no clinic), `admin-c1`, `staff-c1`, `dr-a`
/// (clinic C1) and `staff-c2` (clinic C2). Each user's token is `tok-<id>`.
pub async fn start_test_server() -> TestServer {
    let store = Arc::new(DocumentStore::in_memory());
    let mut verifier = StaticTokenVerifier::new();
    for (id, role, tenant) in [
        ("root", "SUPER_ADMIN", None),
        ("admin-c1", "CLINIC_ADMIN", Some("C1")),
        ("staff-c1", "STAFF", Some("C1")),
        ("dr-a", "DOCTOR", Some("C1")),
        ("staff-c2", "STAFF", Some("C2")),
    ] {
        store
            .put_document(EntityKind::User, id, json!({"role": role, "tenantId": tenant}))
            .await
            .unwrap();
        verifier = verifier.with_token(&format!("tok-{id}"), id);
    }
    // token whose subject has no directory record
    verifier = verifier.with_token("tok-ghost", "ghost");

    let rooms = Arc::new(RoomRegistry::new());
    let services = Arc::new(Services {
        scheduler: Arc::new(Scheduler::new(store.clone())),
        gateway: Arc::new(Gateway::new(Arc::new(verifier), store.clone(), rooms.clone())),
        store: store.clone(),
    });
    let propagation = Propagator::new(store.clone(), rooms.clone()).start().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let closing = shutdown.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let services = services.clone();
            let closing = closing.clone();
            tokio::spawn(async move {
                let _ = server::process_connection(socket, services, closing).await;
            });
        }
    });

    TestServer {
        addr,
        store,
        rooms,
        propagation,
        shutdown,
    }
}

pub struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    next_ref: u64,
    /// Events that arrived while waiting for a reply.
    events: VecDeque<Value>,
}

impl Client {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
            next_ref: 1,
            events: VecDeque::new(),
        }
    }

    /// Connect and authenticate as `user`.
    pub async fn login(addr: SocketAddr, user: &str) -> Self {
        let mut client = Self::connect(addr).await;
        client.send(json!({"op": "auth", "token": format!("tok-{user}")})).await;
        let ready = client.recv().await.expect("no ready frame");
        assert_eq!(ready["type"], "ready", "login as {user}: {ready}");
        client
    }

    pub async fn send(&mut self, frame: Value) {
        self.framed.send(frame.to_string()).await.unwrap();
    }

    /// Next frame, or None if the server closed the connection or nothing
    /// arrived within two seconds.
    pub async fn recv(&mut self) -> Option<Value> {
        match tokio::time::timeout(Duration::from_secs(2), self.framed.next()).await {
            Ok(Some(Ok(line))) => Some(serde_json::from_str(&line).unwrap()),
            _ => None,
        }
    }

    /// Send a request with a fresh `ref` and return its answer. Events that
    /// arrive first are kept for `next_event`.
    pub async fn call(&mut self, mut frame: Value) -> Value {
        let reference = self.next_ref;
        self.next_ref += 1;
        frame["ref"] = json!(reference);
        self.send(frame).await;
        loop {
            let reply = self.recv().await.expect("no reply");
            if reply["type"] == "event" {
                self.events.push_back(reply);
                continue;
            }
            assert_eq!(reply["ref"], json!(reference), "{reply}");
            return reply;
        }
    }

    /// Next pushed event frame.
    pub async fn next_event(&mut self) -> Option<Value> {
        if let Some(frame) = self.events.pop_front() {
            return Some(frame);
        }
        let frame = self.recv().await?;
        assert_eq!(frame["type"], "event", "{frame}");
        Some(frame)
    }

    /// True if no frame arrives within `wait`.
    pub async fn is_quiet(&mut self, wait: Duration) -> bool {
        self.events.is_empty() && tokio::time::timeout(wait, self.framed.next()).await.is_err()
    }
}
