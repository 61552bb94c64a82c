use std::{net::SocketAddr, sync::Arc};

use terminal_chat::{
    event::{self, Event},
    headers::CredentialHeaders,
    registry::{
        self, ConnectionRegistry, Outbound, RegisterError, RouteError, SessionHandle,
        OUTBOX_CAPACITY,
    },
    security::{Rounds, Security, SessionKey},
};
use tokio::sync::mpsc;

struct Fixture {
    registry: Arc<ConnectionRegistry>,
    security: Security,
    key: SessionKey,
}

impl Fixture {
    fn new() -> Self {
        let rounds = Rounds::try_from(3).expect("rounds");
        let key = SessionKey::generate();
        let security = Security::new(&key, rounds);
        Self {
            registry: Arc::new(ConnectionRegistry::new(security.clone(), "top_secret")),
            security,
            key,
        }
    }

    fn session(&self) -> (SessionHandle, mpsc::Receiver<Outbound>) {
        let (tx, rx) = registry::outbox();
        let addr = SocketAddr::from(([127, 0, 0, 1], 5000));
        (SessionHandle::new(self.registry.next_session_id(), addr, tx), rx)
    }

    fn headers(&self, password: &str, username: Option<&str>) -> CredentialHeaders {
        CredentialHeaders::seal(&self.security, password, username).expect("seal headers")
    }

    fn drain(&self, rx: &mut mpsc::Receiver<Outbound>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(outbound) = rx.try_recv() {
            let Outbound::Frame(frame) = outbound else {
                panic!("registry never closes connections itself");
            };
            let plaintext = self.security.decrypt(&frame).expect("decrypt frame");
            events.push(event::decode(&plaintext).expect("decode frame"));
        }
        events
    }
}

#[tokio::test]
async fn correct_password_registers_and_wrong_password_is_refused() {
    let fixture = Fixture::new();

    let (alice, mut alice_rx) = fixture.session();
    fixture
        .registry
        .register(alice, &fixture.headers("top_secret", Some("alice")))
        .await
        .expect("alice registers");
    assert_eq!(fixture.registry.session_count().await, 1);
    assert_eq!(fixture.drain(&mut alice_rx), vec![Event::Users { count: 1 }]);

    let (bob, _bob_rx) = fixture.session();
    let result = fixture
        .registry
        .register(bob, &fixture.headers("wrong", Some("bob")))
        .await;
    assert_eq!(result, Err(RegisterError::AuthenticationFailure));
    assert_eq!(fixture.registry.session_count().await, 1);
    assert!(fixture.drain(&mut alice_rx).is_empty());
}

#[tokio::test]
async fn mismatched_round_count_is_an_authentication_failure() {
    let fixture = Fixture::new();

    for rounds in [1, 2, 4, 5] {
        let rounds = Rounds::try_from(rounds).expect("rounds");
        let mismatched = Security::new(&fixture.key, rounds);
        let headers = CredentialHeaders::seal(&mismatched, "top_secret", None).expect("seal");

        let (session, _rx) = fixture.session();
        let result = fixture.registry.register(session, &headers).await;
        assert_eq!(result, Err(RegisterError::AuthenticationFailure));
    }

    let foreign_key = Security::new(&SessionKey::generate(), Rounds::default());
    let headers = CredentialHeaders::seal(&foreign_key, "top_secret", None).expect("seal");
    let (session, _rx) = fixture.session();
    let result = fixture.registry.register(session, &headers).await;
    assert_eq!(result, Err(RegisterError::AuthenticationFailure));
    assert_eq!(fixture.registry.session_count().await, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_duplicate_username_admits_exactly_one() {
    let fixture = Fixture::new();
    let headers = fixture.headers("top_secret", Some("alice"));

    let (first, _first_rx) = fixture.session();
    let (second, _second_rx) = fixture.session();

    let registry_a = Arc::clone(&fixture.registry);
    let registry_b = Arc::clone(&fixture.registry);
    let headers_a = headers.clone();
    let headers_b = headers.clone();

    let (a, b) = tokio::join!(
        tokio::spawn(async move { registry_a.register(first, &headers_a).await }),
        tokio::spawn(async move { registry_b.register(second, &headers_b).await }),
    );
    let outcomes = [a.expect("join a"), b.expect("join b")];

    let admitted = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(admitted, 1);
    assert!(outcomes
        .iter()
        .any(|outcome| *outcome == Err(RegisterError::DuplicateIdentity("alice".into()))));
    assert_eq!(fixture.registry.session_count().await, 1);
    assert_eq!(fixture.registry.username_count().await, 1);
}

#[tokio::test]
async fn anonymous_sessions_do_not_claim_usernames() {
    let fixture = Fixture::new();

    let (anon_a, _a) = fixture.session();
    let (anon_b, _b) = fixture.session();
    let (named, _n) = fixture.session();

    let anonymous = fixture.headers("top_secret", None);
    let empty = fixture.headers("top_secret", Some(""));
    let registry = &fixture.registry;
    registry.register(anon_a, &anonymous).await.expect("anon a");
    registry.register(anon_b, &empty).await.expect("anon b");
    registry
        .register(named, &fixture.headers("top_secret", Some("carol")))
        .await
        .expect("named");

    assert_eq!(registry.session_count().await, 3);
    assert_eq!(registry.username_count().await, 1);
}

#[tokio::test]
async fn unregister_is_idempotent() {
    let fixture = Fixture::new();
    let (alice, _alice_rx) = fixture.session();
    let registration = fixture
        .registry
        .register(alice, &fixture.headers("top_secret", Some("alice")))
        .await
        .expect("register");

    let departure = fixture
        .registry
        .unregister(registration.id)
        .await
        .expect("first unregister removes");
    assert_eq!(departure.username.as_deref(), Some("alice"));

    assert!(fixture.registry.unregister(registration.id).await.is_none());
    assert!(fixture.registry.unregister(9_999).await.is_none());
    assert_eq!(fixture.registry.session_count().await, 0);
    assert_eq!(fixture.registry.username_count().await, 0);

    // The name is free again.
    let (again, _again_rx) = fixture.session();
    fixture
        .registry
        .register(again, &fixture.headers("top_secret", Some("alice")))
        .await
        .expect("name reusable after unregister");
}

#[tokio::test]
async fn remaining_members_see_count_after_departures() {
    let fixture = Fixture::new();
    let mut members = Vec::new();

    for index in 0..5 {
        let (session, rx) = fixture.session();
        let name = format!("user_{index}");
        let registration = fixture
            .registry
            .register(session, &fixture.headers("top_secret", Some(name.as_str())))
            .await
            .expect("register");
        members.push((registration.id, rx));
    }

    for (id, _) in members.iter().take(2) {
        fixture.registry.unregister(*id).await;
    }

    for (_, rx) in members.iter_mut().skip(2) {
        let events = fixture.drain(rx);
        assert_eq!(events.last(), Some(&Event::Users { count: 3 }));
    }
    assert_eq!(fixture.registry.username_count().await, 3);
}

#[tokio::test]
async fn messages_are_relayed_with_the_claimed_sender() {
    let fixture = Fixture::new();

    let (alice, mut alice_rx) = fixture.session();
    let (bob, mut bob_rx) = fixture.session();
    let alice = fixture
        .registry
        .register(alice, &fixture.headers("top_secret", Some("alice")))
        .await
        .expect("alice");
    fixture
        .registry
        .register(bob, &fixture.headers("top_secret", Some("bob")))
        .await
        .expect("bob");
    fixture.drain(&mut alice_rx);
    fixture.drain(&mut bob_rx);

    for message in [Event::message("alice", "hi"), Event::message("mallory", "boo")] {
        let frame = fixture
            .security
            .encrypt(event::encode(&message).expect("encode"))
            .expect("encrypt");
        fixture
            .registry
            .route_client_message(alice.id, &frame)
            .await
            .expect("route");
    }

    let expected = vec![Event::message("alice", "hi"), Event::message("mallory", "boo")];
    assert_eq!(fixture.drain(&mut bob_rx), expected);
    assert_eq!(fixture.drain(&mut alice_rx), expected);
}

#[tokio::test]
async fn undecryptable_or_malformed_frames_are_refused() {
    let fixture = Fixture::new();

    let result = fixture
        .registry
        .route_client_message(1, b"definitely not ciphertext")
        .await;
    assert!(matches!(result, Err(RouteError::AuthenticationFailure(_))));

    let frame = fixture
        .security
        .encrypt(br#"{"type":"message","from":"alice"}"#)
        .expect("encrypt");
    let result = fixture.registry.route_client_message(1, &frame).await;
    assert!(matches!(result, Err(RouteError::DecodeFailure(_))));
}

#[tokio::test]
async fn member_that_never_reads_is_evicted_at_capacity() {
    let fixture = Fixture::new();

    let (idle, idle_rx) = fixture.session();
    let idle_id = idle.id();
    let membership = idle.membership();
    fixture
        .registry
        .register(idle, &fixture.headers("top_secret", Some("idle")))
        .await
        .expect("register idle");

    let (reader, mut reader_rx) = fixture.session();
    fixture
        .registry
        .register(reader, &fixture.headers("top_secret", Some("reader")))
        .await
        .expect("register reader");
    fixture.drain(&mut reader_rx);

    // The idle member already holds the two count announcements.
    for index in 0..OUTBOX_CAPACITY {
        let event = Event::message("reader", format!("message {index}"));
        fixture.registry.broadcast(&event).await.expect("broadcast");
        fixture.drain(&mut reader_rx);
    }

    assert_eq!(fixture.registry.session_count().await, 1);
    assert_eq!(fixture.registry.username_count().await, 1);
    assert!(membership.has_changed().is_err());
    assert_eq!(idle_rx.len(), OUTBOX_CAPACITY);

    let event = Event::message("reader", "after eviction");
    assert_eq!(fixture.registry.broadcast(&event).await.expect("broadcast"), 1);
    assert_eq!(idle_rx.len(), OUTBOX_CAPACITY);
    assert_eq!(
        fixture.drain(&mut reader_rx),
        vec![Event::message("reader", "after eviction")]
    );

    // The evicted member's own departure is already accounted for.
    assert!(fixture.registry.unregister(idle_id).await.is_none());
}
