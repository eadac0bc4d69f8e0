use super::*;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use axum::{routing::post, Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;

struct FakeExchange {
    fail: AtomicBool,
    calls: AtomicUsize,
}

impl FakeExchange {
    fn new(fail: bool) -> Arc<Self> {
        Arc::new(Self {
            fail: AtomicBool::new(fail),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl IdentityExchange for FakeExchange {
    async fn exchange(&self, identity: &BackingIdentity) -> Result<Session, AuthExchangeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthExchangeError::Rejected("user disabled".to_string()));
        }
        Ok(session_for(&identity.email))
    }
}

fn session_for(email: &str) -> Session {
    Session {
        user_id: UserId(format!("id-{email}")),
        email: EmailAddress::from_trusted(email),
        preferred_language: LanguageCode("fr".to_string()),
        auth_token: Some("token".to_string()),
    }
}

fn identity(email: &str) -> BackingIdentity {
    BackingIdentity {
        uid: format!("uid-{email}"),
        email: email.to_string(),
    }
}

#[tokio::test]
async fn successful_exchange_publishes_session() {
    let context = SessionContext::new(FakeExchange::new(false));
    let mut sessions = context.subscribe();

    let session = context
        .on_identity_changed(Some(identity("a@x.com")))
        .await
        .expect("exchange");

    assert_eq!(session, Some(session_for("a@x.com")));
    assert!(sessions.has_changed().expect("sender alive"));
    assert_eq!(*sessions.borrow_and_update(), Some(session_for("a@x.com")));
    assert_eq!(context.current(), Some(session_for("a@x.com")));
}

#[tokio::test]
async fn repeated_identical_identity_does_not_republish() {
    let exchange = FakeExchange::new(false);
    let context = SessionContext::new(exchange.clone());
    context
        .on_identity_changed(Some(identity("a@x.com")))
        .await
        .expect("exchange");
    let mut sessions = context.subscribe();

    context
        .on_identity_changed(Some(identity("a@x.com")))
        .await
        .expect("exchange");

    assert_eq!(exchange.calls.load(Ordering::SeqCst), 2);
    assert!(!sessions.has_changed().expect("sender alive"));
    assert!(sessions.borrow_and_update().is_some());
}

#[tokio::test]
async fn failed_exchange_logs_out() {
    let exchange = FakeExchange::new(false);
    let context = SessionContext::new(exchange.clone());
    context
        .on_identity_changed(Some(identity("a@x.com")))
        .await
        .expect("exchange");

    exchange.fail.store(true, Ordering::SeqCst);
    let err = context
        .on_identity_changed(Some(identity("a@x.com")))
        .await
        .expect_err("rejected");

    assert!(matches!(err, AuthExchangeError::Rejected(_)));
    assert_eq!(context.current(), None);
}

#[tokio::test]
async fn missing_identity_logs_out() {
    let context = SessionContext::new(FakeExchange::new(false));
    context
        .on_identity_changed(Some(identity("a@x.com")))
        .await
        .expect("exchange");

    let outcome = context.on_identity_changed(None).await.expect("logout");

    assert_eq!(outcome, None);
    assert_eq!(context.current(), None);
}

/// Holds every exchange until released.
struct GatedExchange {
    release: tokio::sync::Notify,
    started: tokio::sync::Notify,
}

#[async_trait]
impl IdentityExchange for GatedExchange {
    async fn exchange(&self, identity: &BackingIdentity) -> Result<Session, AuthExchangeError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(session_for(&identity.email))
    }
}

#[tokio::test]
async fn logout_during_exchange_wins() {
    let exchange = Arc::new(GatedExchange {
        release: tokio::sync::Notify::new(),
        started: tokio::sync::Notify::new(),
    });
    let context = Arc::new(SessionContext::new(exchange.clone()));

    let pending = tokio::spawn({
        let context = Arc::clone(&context);
        async move { context.on_identity_changed(Some(identity("a@x.com"))).await }
    });
    exchange.started.notified().await;

    context.on_identity_changed(None).await.expect("logout");
    exchange.release.notify_one();

    let outcome = pending.await.expect("exchange task").expect("exchange");
    assert_eq!(outcome, None);
    assert_eq!(context.current(), None);
}

#[tokio::test]
async fn missing_exchange_never_signs_in() {
    let context = SessionContext::new(Arc::new(MissingIdentityExchange));
    assert!(context
        .on_identity_changed(Some(identity("a@x.com")))
        .await
        .is_err());
    assert_eq!(context.current(), None);
}

#[tokio::test]
async fn http_exchange_posts_identity_and_parses_user() {
    let app = Router::new().route(
        "/lstm/auth/login",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["id"], "uid-1");
            assert_eq!(body["email"], "a@x.com");
            Json(json!({
                "user": {
                    "_id": "u1",
                    "email": "a@x.com",
                    "preferredLanguage": "de",
                    "token": "jwt"
                }
            }))
        }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let exchange = HttpIdentityExchange::new(format!("http://{addr}/"));
    let session = exchange
        .exchange(&BackingIdentity {
            uid: "uid-1".to_string(),
            email: "a@x.com".to_string(),
        })
        .await
        .expect("exchange");

    assert_eq!(session.user_id, UserId("u1".to_string()));
    assert_eq!(session.preferred_language, LanguageCode("de".to_string()));
    assert_eq!(session.auth_token.as_deref(), Some("jwt"));
}

#[tokio::test]
async fn http_exchange_without_user_fails() {
    let app = Router::new().route(
        "/lstm/auth/login",
        post(|| async { Json(json!({ "message": "unknown" })) }),
    );
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let err = HttpIdentityExchange::new(format!("http://{addr}"))
        .exchange(&identity("a@x.com"))
        .await
        .expect_err("no user");
    assert!(matches!(err, AuthExchangeError::MissingUser));
}
